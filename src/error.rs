//! Error types for Tunium

use thiserror::Error;

/// Main error type for Tunium
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind failed: {0}")]
    Bind(std::io::Error),

    #[error("Connect failed: {0}")]
    Connect(std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Preset validation error: {0}")]
    PresetValidation(String),

    #[error("Preset protocol failure: {0}")]
    PresetProtocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Idle timeout")]
    Timeout,
}

/// Result type alias for Tunium
pub type Result<T> = std::result::Result<T, Error>;
