//! Prometheus-based performance counters
//!
//! Counters feed the optional `--profile` report written at shutdown.
//! Everything is registered on a private registry so tests can run the
//! relay machinery without global registry collisions.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    /// Registry backing the profile report
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total relays constructed
    pub static ref RELAYS_TOTAL: IntCounter = IntCounter::new(
        "tunium_relays_total",
        "Total number of relays constructed"
    ).unwrap();

    /// Currently active relays
    pub static ref RELAYS_ACTIVE: IntGauge = IntGauge::new(
        "tunium_relays_active",
        "Number of currently active relays"
    ).unwrap();

    /// Bytes pumped inbound -> outbound after pipeline transforms
    pub static ref BYTES_FORWARD: IntCounter = IntCounter::new(
        "tunium_bytes_forward_total",
        "Bytes relayed in the forward direction"
    ).unwrap();

    /// Bytes pumped outbound -> inbound after pipeline transforms
    pub static ref BYTES_BACKWARD: IntCounter = IntCounter::new(
        "tunium_bytes_backward_total",
        "Bytes relayed in the backward direction"
    ).unwrap();

    /// Preset protocol failures
    pub static ref PRESET_FAILURES: IntCounter = IntCounter::new(
        "tunium_preset_failures_total",
        "Number of preset protocol failures"
    ).unwrap();

    /// Failed outbound connection attempts
    pub static ref CONNECT_FAILURES: IntCounter = IntCounter::new(
        "tunium_connect_failures_total",
        "Number of failed outbound connections"
    ).unwrap();

    /// Relays spliced raw to the redirect target after a preset failure
    pub static ref REDIRECTS: IntCounter = IntCounter::new(
        "tunium_redirects_total",
        "Number of relays redirected after preset failure"
    ).unwrap();
}

/// Register every counter. Safe to call more than once.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(RELAYS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RELAYS_ACTIVE.clone()));
    let _ = REGISTRY.register(Box::new(BYTES_FORWARD.clone()));
    let _ = REGISTRY.register(Box::new(BYTES_BACKWARD.clone()));
    let _ = REGISTRY.register(Box::new(PRESET_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(CONNECT_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(REDIRECTS.clone()));
}

/// Render the registry in the Prometheus text exposition format
pub fn report() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_renders_counters() {
        register_metrics();
        register_metrics(); // idempotent
        RELAYS_TOTAL.inc();
        let report = report();
        assert!(report.contains("tunium_relays_total"));
    }
}
