//! Configuration module for Tunium
//!
//! A JSON file provides the base values, CLI flags override them, and
//! validation produces one immutable `CoreConfig` snapshot. Every relay
//! captures the snapshot current at accept time; hot reload installs new
//! snapshots without touching running relays.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::common::Address;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::preset::{PresetContext, PresetSpec, Role};

/// Default local bind port
pub const DEFAULT_PORT: u16 = 1080;

/// Default idle timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Transport used for the client-to-server hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerTransport {
    #[default]
    Tcp,
    H2,
}

impl ServerTransport {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "tcp" => Ok(ServerTransport::Tcp),
            "h2" => Ok(ServerTransport::H2),
            other => Err(Error::Config(format!(
                "unknown server transport: {} (expected \"tcp\" or \"h2\")",
                other
            ))),
        }
    }
}

// ============================================================================
// File schema
// ============================================================================

/// Raw JSON configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Client only. Entries prefixed `-` are disabled and filtered out.
    pub servers: Vec<String>,
    pub key: Option<String>,
    pub presets: Vec<PresetSpec>,
    /// Server only: `host:port` fallback for preset failures
    pub redirect: Option<String>,
    pub timeout: Option<u64>,
    pub server_transport: Option<String>,
    pub tls_ca: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl FileConfig {
    /// Load and parse a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Values taken from the command line; set fields win over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub key: Option<String>,
    pub redirect: Option<String>,
    pub timeout: Option<u64>,
}

// ============================================================================
// Validated snapshot
// ============================================================================

/// Immutable validated runtime parameters, shared by reference with every
/// relay built while this snapshot is installed.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub role: Role,
    pub bind: Address,
    /// Enabled upstream servers (client role)
    pub servers: Vec<Address>,
    /// Shared secret
    pub key: String,
    /// Preset chain, applied in order on forward, reversed on backward
    pub presets: Vec<PresetSpec>,
    /// Preset-failure fallback (server role)
    pub redirect: Option<Address>,
    /// Idle timeout
    pub timeout: Duration,
    pub server_transport: ServerTransport,
    /// CA bundle for the HTTP/2 endpoint
    pub tls_ca: Option<PathBuf>,
}

impl CoreConfig {
    /// Merge file and CLI values for `role` and validate the result
    pub fn build(role: Role, file: FileConfig, overrides: Overrides) -> Result<Self> {
        let host = overrides
            .host
            .or(file.host)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = overrides.port.or(file.port).unwrap_or(DEFAULT_PORT);
        let bind_ip: std::net::IpAddr = host
            .parse()
            .map_err(|_| Error::Config(format!("bind host must be an IP address: {}", host)))?;
        let bind = Address::Socket(std::net::SocketAddr::new(bind_ip, port));

        let key = overrides
            .key
            .or(file.key)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("key is required".into()))?;

        if file.presets.is_empty() {
            return Err(Error::Config("at least one preset is required".into()));
        }

        let mut servers = Vec::new();
        for entry in &file.servers {
            if let Some(disabled) = entry.strip_prefix('-') {
                tracing::debug!(server = disabled, "server entry disabled");
                continue;
            }
            servers.push(entry.parse::<Address>()?);
        }
        if role == Role::Client && servers.is_empty() {
            return Err(Error::Config(
                "client requires at least one enabled server".into(),
            ));
        }

        let redirect = overrides
            .redirect
            .or(file.redirect)
            .map(|s| s.parse::<Address>())
            .transpose()?;
        if role == Role::Client && redirect.is_some() {
            return Err(Error::Config(
                "redirect is only valid for the server role".into(),
            ));
        }

        let timeout_secs = overrides
            .timeout
            .or(file.timeout)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(Error::Config("timeout must be at least 1 second".into()));
        }

        let server_transport = file
            .server_transport
            .as_deref()
            .map(ServerTransport::from_name)
            .transpose()?
            .unwrap_or_default();

        let cfg = Self {
            role,
            bind,
            servers,
            key,
            presets: file.presets,
            redirect,
            timeout: Duration::from_secs(timeout_secs),
            server_transport,
            tls_ca: file.tls_ca,
        };
        cfg.validate_presets()?;
        Ok(cfg)
    }

    /// Probe-build the configured chain so bad preset names or parameters
    /// surface at startup rather than on the first connection.
    fn validate_presets(&self) -> Result<()> {
        let ctx = PresetContext {
            role: self.role,
            key: self.key.clone(),
            destination: Some(Address::unspecified()),
        };
        Pipeline::build(&self.presets, &ctx).map(|_| ())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Minimal valid snapshot for unit tests
    pub fn test_config(role: Role, presets: Vec<PresetSpec>) -> CoreConfig {
        CoreConfig {
            role,
            bind: "127.0.0.1:0".parse().unwrap(),
            servers: Vec::new(),
            key: "secret".into(),
            presets,
            redirect: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            server_transport: ServerTransport::Tcp,
            tls_ca: None,
        }
    }

    const CLIENT_JSON: &str = r#"{
        "host": "127.0.0.1",
        "port": 1080,
        "servers": ["198.51.100.7:7777", "-198.51.100.8:7777"],
        "key": "secret",
        "presets": [
            {"name": "exp-base-auth-stream", "params": {"method": "aes-256-ctr"}}
        ],
        "timeout": 300
    }"#;

    #[test]
    fn test_parse_and_build_client() {
        let file = FileConfig::from_json(CLIENT_JSON).unwrap();
        let cfg = CoreConfig::build(Role::Client, file, Overrides::default()).unwrap();

        assert_eq!(cfg.bind, "127.0.0.1:1080".parse().unwrap());
        // the disabled entry is filtered out
        assert_eq!(cfg.servers, vec!["198.51.100.7:7777".parse().unwrap()]);
        assert_eq!(cfg.timeout, Duration::from_secs(300));
        assert_eq!(cfg.server_transport, ServerTransport::Tcp);
    }

    #[test]
    fn test_overrides_win() {
        let file = FileConfig::from_json(CLIENT_JSON).unwrap();
        let overrides = Overrides {
            port: Some(9999),
            key: Some("other".into()),
            timeout: Some(60),
            ..Default::default()
        };
        let cfg = CoreConfig::build(Role::Client, file, overrides).unwrap();
        assert_eq!(cfg.bind.port(), 9999);
        assert_eq!(cfg.key, "other");
        assert_eq!(cfg.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_key_required() {
        let file = FileConfig::from_json(r#"{"presets": [{"name": "tracker"}]}"#).unwrap();
        let err = CoreConfig::build(Role::Server, file, Overrides::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_presets_required() {
        let file = FileConfig::from_json(r#"{"key": "secret"}"#).unwrap();
        assert!(CoreConfig::build(Role::Server, file, Overrides::default()).is_err());
    }

    #[test]
    fn test_client_requires_server() {
        let file = FileConfig::from_json(
            r#"{"key": "secret", "presets": [{"name": "tracker"}]}"#,
        )
        .unwrap();
        assert!(CoreConfig::build(Role::Client, file, Overrides::default()).is_err());
    }

    #[test]
    fn test_bad_preset_rejected_at_startup() {
        let file = FileConfig::from_json(
            r#"{
                "key": "secret",
                "presets": [{"name": "exp-base-auth-stream", "params": {"method": "rc4-md5"}}]
            }"#,
        )
        .unwrap();
        let err = CoreConfig::build(Role::Server, file, Overrides::default()).unwrap_err();
        assert!(matches!(err, Error::PresetValidation(_)));
    }

    #[test]
    fn test_redirect_is_server_only() {
        let file = FileConfig::from_json(
            r#"{
                "key": "secret",
                "servers": ["198.51.100.7:7777"],
                "redirect": "127.0.0.1:7",
                "presets": [{"name": "tracker"}]
            }"#,
        )
        .unwrap();
        assert!(CoreConfig::build(Role::Client, file.clone(), Overrides::default()).is_err());

        let cfg = CoreConfig::build(Role::Server, file, Overrides::default()).unwrap();
        assert_eq!(cfg.redirect, Some("127.0.0.1:7".parse().unwrap()));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(FileConfig::from_json(r#"{"keyy": "secret"}"#).is_err());
    }

    #[test]
    fn test_bad_transport_rejected() {
        let file = FileConfig::from_json(
            r#"{"key": "secret", "server_transport": "quic", "presets": [{"name": "tracker"}]}"#,
        )
        .unwrap();
        assert!(CoreConfig::build(Role::Server, file, Overrides::default()).is_err());
    }

    #[test]
    fn test_domain_bind_rejected() {
        let file = FileConfig::from_json(
            r#"{"host": "example.com", "key": "secret", "presets": [{"name": "tracker"}]}"#,
        )
        .unwrap();
        assert!(CoreConfig::build(Role::Server, file, Overrides::default()).is_err());
    }
}
