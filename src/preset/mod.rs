//! Preset Layer
//!
//! A preset is a stateful per-relay byte transformer. Presets compose into
//! a pipeline: each one wraps outgoing bytes and unwraps incoming bytes,
//! and may carry a wire protocol of its own (address delivery,
//! authentication, encryption).
//!
//! ## The four-operation contract
//!
//! | Operation    | Invoked on     | Meaning                                 |
//! |--------------|----------------|-----------------------------------------|
//! | `client_out` | client forward | wrap a chunk before sending to server   |
//! | `server_in`  | server forward | unwrap a chunk arriving from the client |
//! | `server_out` | server backward| wrap a reply before sending back        |
//! | `client_in`  | client backward| unwrap a reply arriving from the server |
//!
//! Unused operations default to identity. Control flow back to the relay
//! is a tagged action, not a callback: a preset either passes a chunk on,
//! swallows it, asks for the destination to be dialed, or fails.

mod base_auth_stream;
mod tracker;

pub use base_auth_stream::BaseAuthStreamPreset;
pub use tracker::TrackerPreset;

use bytes::Bytes;
use serde::Deserialize;

use crate::common::Address;
use crate::error::{Error, Result};

// ============================================================================
// Roles and actions
// ============================================================================

/// Which side of the tunnel a pipeline serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Outcome of one preset operation on one chunk
#[derive(Debug)]
pub enum PresetAction {
    /// Pass the (possibly transformed) chunk to the next preset
    Next(Bytes),
    /// The chunk was consumed; nothing to pass on yet
    Swallow,
    /// Dial the destination; buffered bytes are released via `on_connected`
    ConnectToDst { addr: Address },
    /// Protocol failure; the relay decides between close and redirect
    Fail { reason: String },
}

// ============================================================================
// Preset trait
// ============================================================================

/// A stateful byte transformer scoped to one relay.
///
/// A preset instance serves both directions of its relay and is only ever
/// driven by one logical task at a time (the pipeline guarantees this).
/// Operations are synchronous and must not block.
pub trait Preset: Send {
    fn name(&self) -> &'static str;

    /// Client forward: wrap a chunk before sending to the server
    fn client_out(&mut self, chunk: Bytes) -> PresetAction {
        PresetAction::Next(chunk)
    }

    /// Server forward: unwrap a chunk arriving from the client
    fn server_in(&mut self, chunk: Bytes) -> PresetAction {
        PresetAction::Next(chunk)
    }

    /// Server backward: wrap a chunk before sending back to the client
    fn server_out(&mut self, chunk: Bytes) -> PresetAction {
        PresetAction::Next(chunk)
    }

    /// Client backward: unwrap a chunk arriving from the server
    fn client_in(&mut self, chunk: Bytes) -> PresetAction {
        PresetAction::Next(chunk)
    }

    /// Called once the deferred outbound is open. A preset that buffered
    /// post-handshake bytes releases them here.
    fn on_connected(&mut self) -> Option<Bytes> {
        None
    }

    /// Teardown flush. A preset holding an incomplete handshake reports
    /// the failure here; anything else is silent.
    fn drain(&mut self) -> Option<PresetAction> {
        None
    }
}

// ============================================================================
// Construction
// ============================================================================

/// One entry of the configured preset chain
#[derive(Debug, Clone, Deserialize)]
pub struct PresetSpec {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl PresetSpec {
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Fetch a required string parameter
    pub fn str_param(&self, key: &str) -> Result<&str> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::PresetValidation(format!(
                    "preset '{}' requires string parameter '{}'",
                    self.name, key
                ))
            })
    }
}

/// Per-relay context handed to preset constructors
#[derive(Debug, Clone)]
pub struct PresetContext {
    pub role: Role,
    /// Shared secret all handshake-bearing presets derive keys from
    pub key: String,
    /// Destination address; known up front on the client only
    pub destination: Option<Address>,
}

/// Build one preset from its spec.
///
/// Fails with a validation error on unknown names or missing/invalid
/// parameters; the relay then refuses to start.
pub fn build_preset(spec: &PresetSpec, ctx: &PresetContext) -> Result<Box<dyn Preset>> {
    match spec.name.as_str() {
        "exp-base-auth-stream" => Ok(Box::new(BaseAuthStreamPreset::new(spec, ctx)?)),
        "tracker" => Ok(Box::new(TrackerPreset::new())),
        other => Err(Error::PresetValidation(format!(
            "unknown preset: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: Role) -> PresetContext {
        PresetContext {
            role,
            key: "secret".into(),
            destination: Some(Address::from_host_port("127.0.0.1", 9)),
        }
    }

    #[test]
    fn test_build_known_presets() {
        let spec = PresetSpec::new(
            "exp-base-auth-stream",
            serde_json::json!({"method": "aes-256-ctr"}),
        );
        assert!(build_preset(&spec, &ctx(Role::Client)).is_ok());
        assert!(build_preset(&spec, &ctx(Role::Server)).is_ok());

        let spec = PresetSpec::new("tracker", serde_json::Value::Null);
        assert!(build_preset(&spec, &ctx(Role::Client)).is_ok());
    }

    #[test]
    fn test_build_unknown_preset() {
        let spec = PresetSpec::new("no-such-preset", serde_json::Value::Null);
        let result = build_preset(&spec, &ctx(Role::Client));
        assert!(matches!(result, Err(Error::PresetValidation(_))));
    }

    #[test]
    fn test_missing_params_rejected() {
        let spec = PresetSpec::new("exp-base-auth-stream", serde_json::Value::Null);
        assert!(build_preset(&spec, &ctx(Role::Client)).is_err());
    }
}
