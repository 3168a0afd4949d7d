//! Configuration for runs, browser provisioning and the automation server

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SUITERUN_CONFIG";

/// Environment variable holding the expected API token
pub const API_TOKEN_ENV: &str = "API_TOKEN";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Expected invocation token; usually supplied through `API_TOKEN`
    pub api_token: Option<String>,

    /// Test-automation server configuration
    pub server: ServerConfig,

    /// Headless browser configuration
    pub browser: BrowserConfig,

    /// Test file resolution
    pub resolver: ResolverConfig,

    /// Per-run limits
    pub run: RunConfig,
}

/// Test-automation server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Hostname the automation server binds to
    pub host: String,

    /// Port pair used by the automation server
    pub ports: [u16; 2],

    /// Node.js binary running the bridge
    pub node_binary: String,

    /// `NODE_PATH` under which the automation framework is installed
    pub node_path: Option<PathBuf>,

    /// Timeout for the bridge to report that the server started
    pub startup_timeout_secs: u64,

    /// Grace period for a clean server shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            ports: [1337, 1338],
            node_binary: "node".to_string(),
            node_path: None,
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 5,
        }
    }
}

/// How the headless browser binary is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserStrategy {
    /// Binary already available in the execution environment
    #[default]
    Preinstalled,
    /// Binary shipped with the deployment artifact
    Bundled,
    /// Launcher package installed into scratch space on first use
    OnDemand,
}

impl FromStr for BrowserStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preinstalled" => Ok(BrowserStrategy::Preinstalled),
            "bundled" => Ok(BrowserStrategy::Bundled),
            "on-demand" | "on_demand" | "ondemand" => Ok(BrowserStrategy::OnDemand),
            other => Err(Error::InvalidConfig(format!(
                "unknown browser strategy '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BrowserStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserStrategy::Preinstalled => write!(f, "preinstalled"),
            BrowserStrategy::Bundled => write!(f, "bundled"),
            BrowserStrategy::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Headless browser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub strategy: BrowserStrategy,

    /// Explicit browser binary (preinstalled) or bundled binary location
    pub executable_path: Option<PathBuf>,

    /// Timeout for the DevTools endpoint to come up after launch
    pub launch_timeout_secs: u64,

    /// Additional flags appended to every launch
    pub extra_args: Vec<String>,

    /// On-demand install settings
    pub install: InstallConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            strategy: BrowserStrategy::default(),
            executable_path: None,
            launch_timeout_secs: 15,
            extra_args: Vec::new(),
            install: InstallConfig::default(),
        }
    }
}

/// On-demand install settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// npm package providing the browser launcher
    pub package: String,

    /// Version requirement written into the throwaway manifest
    pub version: String,

    /// Writable directory the package is installed into
    pub scratch_dir: PathBuf,

    pub npm_binary: String,
    pub node_binary: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            package: "@sparticuz/chromium".to_string(),
            version: "^119.0.0".to_string(),
            scratch_dir: crate::default_scratch_dir().join("browser"),
            npm_binary: "npm".to_string(),
            node_binary: "node".to_string(),
        }
    }
}

/// Test file resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Directory bare references are joined to (None = process cwd)
    pub working_dir: Option<PathBuf>,

    /// Directory fetched test files are written to
    pub scratch_dir: PathBuf,

    pub fetch_timeout_secs: u64,

    /// Keep fetched files after the run instead of deleting them
    pub keep_fetched: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            scratch_dir: std::env::temp_dir(),
            fetch_timeout_secs: 30,
            keep_fetched: false,
        }
    }
}

/// Per-run limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Deadline for the browser to connect to the automation server; 0 waits forever
    pub readiness_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from `SUITERUN_CONFIG` (or `path`, if given) and apply environment overrides
    pub fn from_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Self::load(Path::new(&path))?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides looked up by environment variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty(API_TOKEN_ENV) {
            self.api_token = Some(token);
        }
        if let Some(strategy) = non_empty("SUITERUN_BROWSER_STRATEGY") {
            self.browser.strategy = strategy.parse()?;
        }
        if let Some(path) = non_empty("SUITERUN_BROWSER_PATH") {
            self.browser.executable_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty("SUITERUN_NODE_PATH") {
            self.server.node_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = non_empty("SUITERUN_SCRATCH_DIR") {
            let dir = PathBuf::from(dir);
            self.browser.install.scratch_dir = dir.join("browser");
            self.resolver.scratch_dir = dir;
        }
        if let Some(dir) = non_empty("SUITERUN_WORKING_DIR") {
            self.resolver.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = non_empty("SUITERUN_READINESS_TIMEOUT_SECS") {
            self.run.readiness_timeout_secs = secs.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("invalid readiness timeout '{}'", secs))
            })?;
        }
        Ok(())
    }

    /// Working directory bare references are resolved against
    pub fn working_dir(&self) -> PathBuf {
        self.resolver
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn readiness_timeout(&self) -> Option<Duration> {
        match self.run.readiness_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
