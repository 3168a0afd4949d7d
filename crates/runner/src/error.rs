//! Error types for test runs

use std::path::PathBuf;
use thiserror::Error;

use suiterun_common::RunFailure;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Automation server failed to start: {0}")]
    ServerStartup(String),

    #[error("Automation server exited: {0}")]
    ServerExited(String),

    #[error("Browser connection error: {0}")]
    Connection(String),

    #[error("Browser did not connect to the automation server within {seconds}s")]
    ReadinessTimeout { seconds: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("No headless browser found (tried: {0})")]
    BrowserNotFound(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Browser provisioning failed: {0}")]
    Provisioning(String),

    #[error("Test run failed for {}: {reason}", file.display())]
    TestRun { file: PathBuf, reason: String },

    #[error("Unreadable report for {}: {reason}", file.display())]
    Report { file: PathBuf, reason: String },

    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type RunResult<T> = Result<T, RunError>;

impl RunError {
    /// Stable identifier used in serialized failures
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::ServerStartup(_) => "server_startup",
            RunError::ServerExited(_) => "server_exited",
            RunError::Connection(_) => "connection",
            RunError::ReadinessTimeout { .. } => "readiness_timeout",
            RunError::Cancelled => "cancelled",
            RunError::BrowserNotFound(_) => "browser_not_found",
            RunError::BrowserLaunch(_) => "browser_launch",
            RunError::Provisioning(_) => "provisioning",
            RunError::TestRun { .. } => "test_run",
            RunError::Report { .. } => "report",
            RunError::Fetch { .. } => "fetch",
            RunError::Io(_) => "io",
            RunError::Json(_) => "json",
            RunError::Http(_) => "http",
        }
    }

    /// Whether the error leaves nothing to run the remaining files against
    pub fn is_run_fatal(&self) -> bool {
        !matches!(self, RunError::TestRun { .. } | RunError::Report { .. })
    }
}

impl From<&RunError> for RunFailure {
    fn from(e: &RunError) -> Self {
        RunFailure {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_errors_are_isolated() {
        let err = RunError::TestRun {
            file: PathBuf::from("/tmp/a.js"),
            reason: "boom".to_string(),
        };
        assert!(!err.is_run_fatal());
        assert!(RunError::ServerExited("gone".to_string()).is_run_fatal());
        assert!(RunError::Cancelled.is_run_fatal());
    }

    #[test]
    fn test_failure_conversion() {
        let failure = RunFailure::from(&RunError::ReadinessTimeout { seconds: 3 });
        assert_eq!(failure.kind, "readiness_timeout");
        assert!(failure.message.contains("3s"));
    }
}
