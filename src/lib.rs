//! Tunium - a pluggable tunneling proxy
//!
//! # Architecture (Preset Pipeline)
//!
//! ```text
//! Application ──▶ Local front (SOCKS5/HTTP CONNECT)
//!                     │
//!                     ▼
//!            Pipeline.forward (preset chain P₁ → … → Pₙ)
//!                     │
//!                     ▼
//!            Transport (TCP / HTTP/2) ──▶ remote server
//!                     │
//!                     ▼
//!            Pipeline.forward (server side) ──▶ destination
//! ```
//!
//! Replies travel the reverse chain. Two roles share one binary: the
//! **client** wraps local application traffic with the preset chain and
//! forwards it to a configured server; the **server** unwraps it, learns
//! the destination from the address-delivery preset and dials out.
//!
//! ## Core Principles
//!
//! - Presets are synchronous byte transformers; all IO lives in the relay
//! - A relay owns its two endpoints and its pipeline; relays share nothing
//! - Configuration is an immutable snapshot captured per relay
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address and its wire form
//! ├── crypto/          # EVP_BytesToKey, HMAC-SHA1, stream ciphers
//! ├── transport/       # Endpoints: inbound TCP listener, TCP/HTTP/2 dialers
//! ├── preset/          # Preset contract + implementations
//! ├── pipeline.rs      # Ordered preset chain
//! ├── proxy/           # Client-side local fronts (SOCKS5, HTTP CONNECT)
//! └── app/             # Application: Hub, Relay, profiling
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod app;
pub mod pipeline;
pub mod preset;
pub mod proxy;
pub mod transport;

// Supporting modules
pub mod config;
pub mod crypto;

// Re-exports for convenience
pub use common::Address;
pub use config::{CoreConfig, FileConfig, Overrides};
pub use error::{Error, Result};

// Architecture re-exports
pub use app::{Hub, Relay};
pub use pipeline::{Pipeline, PipelineOutput};
pub use preset::{Preset, PresetAction, Role};
pub use transport::{Conn, Dialer};
