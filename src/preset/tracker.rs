//! `tracker` preset
//!
//! Identity transform that records chunk counts and byte totals in both
//! directions and logs a summary when the relay tears down. Useful for
//! debugging preset chains without touching the data.

use bytes::Bytes;
use tracing::debug;

use super::{Preset, PresetAction};

#[derive(Default)]
struct DirectionStats {
    chunks: u64,
    bytes: u64,
}

impl DirectionStats {
    fn record(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len as u64;
    }
}

/// Pass-through preset that tracks traffic volume per direction
#[derive(Default)]
pub struct TrackerPreset {
    outbound: DirectionStats,
    inbound: DirectionStats,
}

impl TrackerPreset {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Preset for TrackerPreset {
    fn name(&self) -> &'static str {
        "tracker"
    }

    fn client_out(&mut self, chunk: Bytes) -> PresetAction {
        self.outbound.record(chunk.len());
        PresetAction::Next(chunk)
    }

    fn server_in(&mut self, chunk: Bytes) -> PresetAction {
        self.inbound.record(chunk.len());
        PresetAction::Next(chunk)
    }

    fn server_out(&mut self, chunk: Bytes) -> PresetAction {
        self.outbound.record(chunk.len());
        PresetAction::Next(chunk)
    }

    fn client_in(&mut self, chunk: Bytes) -> PresetAction {
        self.inbound.record(chunk.len());
        PresetAction::Next(chunk)
    }

    fn drain(&mut self) -> Option<PresetAction> {
        debug!(
            out_chunks = self.outbound.chunks,
            out_bytes = self.outbound.bytes,
            in_chunks = self.inbound.chunks,
            in_bytes = self.inbound.bytes,
            "tracker summary"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_passthrough() {
        let mut tracker = TrackerPreset::new();
        match tracker.client_out(Bytes::from_static(b"hello")) {
            PresetAction::Next(chunk) => assert_eq!(&chunk[..], b"hello"),
            other => panic!("{:?}", other),
        }
        match tracker.client_in(Bytes::from_static(b"world!")) {
            PresetAction::Next(chunk) => assert_eq!(&chunk[..], b"world!"),
            other => panic!("{:?}", other),
        }
        assert_eq!(tracker.outbound.chunks, 1);
        assert_eq!(tracker.outbound.bytes, 5);
        assert_eq!(tracker.inbound.bytes, 6);
    }
}
