//! Suiterun Common Library
//!
//! Shared data model, configuration and errors for the suiterun crates.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{
    BrowserConfig, BrowserStrategy, Config, InstallConfig, ResolverConfig, RunConfig,
    ServerConfig,
};
pub use error::{Error, Result};
pub use types::*;

/// Suiterun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default scratch directory for installs and fetched files
pub fn default_scratch_dir() -> std::path::PathBuf {
    std::env::temp_dir().join("suiterun")
}
