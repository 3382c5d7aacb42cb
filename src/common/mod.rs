//! Core types shared across all layers

mod address;

pub use address::Address;

pub use crate::error::{Error, Result};
