//! Error types for suiterun

use thiserror::Error;

/// Result type alias using the suiterun common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration and shared data
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
