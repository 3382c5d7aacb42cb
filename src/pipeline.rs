//! Pipeline - Ordered preset chain
//!
//! A pipeline routes every chunk of one relay through its presets:
//!
//! ```text
//! forward:   P₁ → P₂ → … → Pₙ   (client_out on the client, server_in on the server)
//! backward:  Pₙ → … → P₂ → P₁   (client_in on the client, server_out on the server)
//! ```
//!
//! The same preset instances serve both directions. Control events raised
//! by a preset (`ConnectToDst`, `Fail`) stop the chain and surface to the
//! relay; swallowed chunks stop the chain silently.

use bytes::Bytes;

use crate::common::Address;
use crate::error::Result;
use crate::preset::{build_preset, Preset, PresetAction, PresetContext, PresetSpec, Role};

/// Result of pushing one chunk through the chain
#[derive(Debug)]
pub enum PipelineOutput {
    /// Fully transformed chunk, ready for the peer endpoint
    Emit(Bytes),
    /// A preset consumed the chunk; nothing to send yet
    Hold,
    /// A preset asks for the destination to be dialed
    ConnectToDst(Address),
    /// A preset reported a protocol failure
    Fail(String),
}

/// Ordered chain of preset instances for one relay
pub struct Pipeline {
    role: Role,
    presets: Vec<Box<dyn Preset>>,
}

impl Pipeline {
    /// Build a pipeline from configured preset specs.
    ///
    /// Any invalid spec aborts construction with a validation error.
    pub fn build(specs: &[PresetSpec], ctx: &PresetContext) -> Result<Self> {
        let mut presets = Vec::with_capacity(specs.len());
        for spec in specs {
            presets.push(build_preset(spec, ctx)?);
        }
        Ok(Self {
            role: ctx.role,
            presets,
        })
    }

    /// A pipeline with no presets: every chunk passes through untouched.
    /// Used for the raw redirect splice.
    pub fn empty(role: Role) -> Self {
        Self {
            role,
            presets: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Push a chunk through the forward chain (toward the outbound)
    pub fn forward(&mut self, chunk: Bytes) -> PipelineOutput {
        self.run_forward_from(0, chunk)
    }

    /// Push a chunk through the backward chain (toward the inbound)
    pub fn backward(&mut self, chunk: Bytes) -> PipelineOutput {
        let mut current = chunk;
        for preset in self.presets.iter_mut().rev() {
            let action = match self.role {
                Role::Client => preset.client_in(current),
                Role::Server => preset.server_out(current),
            };
            match action {
                PresetAction::Next(chunk) => current = chunk,
                PresetAction::Swallow => return PipelineOutput::Hold,
                PresetAction::ConnectToDst { addr } => {
                    return PipelineOutput::ConnectToDst(addr)
                }
                PresetAction::Fail { reason } => return PipelineOutput::Fail(reason),
            }
        }
        PipelineOutput::Emit(current)
    }

    /// Signal every preset that the deferred outbound is open.
    ///
    /// Bytes a preset releases continue through the presets downstream of
    /// it; the fully transformed chunks are returned in order for the
    /// relay to write. A failure raised during the release aborts it.
    pub fn notify_connected(&mut self) -> std::result::Result<Vec<Bytes>, String> {
        let mut released = Vec::new();
        for index in 0..self.presets.len() {
            if let Some(data) = self.presets[index].on_connected() {
                match self.run_forward_from(index + 1, data) {
                    PipelineOutput::Emit(chunk) => released.push(chunk),
                    PipelineOutput::Hold => {}
                    PipelineOutput::ConnectToDst(_) => {
                        return Err("connect event during release".into())
                    }
                    PipelineOutput::Fail(reason) => return Err(reason),
                }
            }
        }
        Ok(released)
    }

    /// Teardown flush: the first failure any preset reports, if any
    pub fn drain(&mut self) -> Option<String> {
        let mut failure = None;
        for preset in self.presets.iter_mut() {
            if let Some(PresetAction::Fail { reason }) = preset.drain() {
                failure.get_or_insert(reason);
            }
        }
        failure
    }

    fn run_forward_from(&mut self, start: usize, chunk: Bytes) -> PipelineOutput {
        let mut current = chunk;
        for preset in self.presets[start..].iter_mut() {
            let action = match self.role {
                Role::Client => preset.client_out(current),
                Role::Server => preset.server_in(current),
            };
            match action {
                PresetAction::Next(chunk) => current = chunk,
                PresetAction::Swallow => return PipelineOutput::Hold,
                PresetAction::ConnectToDst { addr } => {
                    return PipelineOutput::ConnectToDst(addr)
                }
                PresetAction::Fail { reason } => return PipelineOutput::Fail(reason),
            }
        }
        PipelineOutput::Emit(current)
    }
}
