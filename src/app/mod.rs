//! Application layer: Hub, Relay and profiling counters

mod hub;
pub mod profile;
mod relay;

pub use hub::Hub;
pub use relay::{Relay, RelayState};
