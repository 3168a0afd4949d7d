//! Browser provisioning
//!
//! A provisioner produces a `BrowserLauncher`: the executable, flags and
//! environment used to start a headless browser. Provisioning happens once
//! per process through `ProvisionContext`; every run launches its own
//! browser from the shared launcher.

use async_trait::async_trait;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use suiterun_common::{BrowserConfig, BrowserStrategy, InstallConfig};

use crate::error::{RunError, RunResult};

/// Default location of a browser shipped with the deployment artifact
pub const DEFAULT_BUNDLED_PATH: &str = "/opt/suiterun/chromium";

/// Binary names searched on `PATH` for a preinstalled browser
const PREINSTALLED_NAMES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "headless_shell",
];

/// Flags for a browser that already runs in a normal environment
pub const HEADLESS_ARGS: &[&str] = &[
    "--headless",
    "--disable-gpu",
    "--enable-automation",
    "--no-first-run",
    "--no-default-browser-check",
    "--mute-audio",
    "--hide-scrollbars",
];

/// Flags for a sandboxed, low-resource function environment
pub const SANDBOXED_ARGS: &[&str] = &[
    "--headless",
    "--single-process",
    "--no-zygote",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--use-gl=swiftshader",
    "--enable-automation",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-breakpad",
    "--disable-client-side-phishing-detection",
    "--disable-component-update",
    "--disable-default-apps",
    "--disable-domain-reliability",
    "--disable-extensions",
    "--disable-hang-monitor",
    "--disable-notifications",
    "--disable-popup-blocking",
    "--disable-print-preview",
    "--disable-prompt-on-repost",
    "--disable-renderer-backgrounding",
    "--disable-speech-api",
    "--disable-sync",
    "--disk-cache-size=33554432",
    "--hide-scrollbars",
    "--metrics-recording-only",
    "--mute-audio",
    "--no-default-browser-check",
    "--no-first-run",
    "--no-pings",
    "--password-store=basic",
    "--use-mock-keychain",
];

/// Asks an installed launcher package for its browser executable
const LOCATE_SCRIPT: &str = r#"
const mod = require(require.resolve(process.argv[1], { paths: [process.cwd()] }))
const launcher = mod.default || mod
Promise.resolve(
  typeof launcher.executablePath === 'function'
    ? launcher.executablePath()
    : launcher.executablePath
)
  .then(executablePath =>
    process.stdout.write(
      JSON.stringify({ executablePath, args: launcher.args || [] })
    )
  )
  .catch(error => {
    process.stderr.write(String(error))
    process.exit(1)
  })
"#;

/// Everything needed to start a headless browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserLauncher {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl BrowserLauncher {
    fn with_args(executable: PathBuf, args: &[&str]) -> Self {
        Self {
            executable,
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
        }
    }
}

/// Obtains a launchable browser
#[async_trait]
pub trait BrowserProvisioner: Send + Sync {
    fn strategy(&self) -> BrowserStrategy;

    async fn provision(&self) -> RunResult<BrowserLauncher>;
}

/// Browser already present in the execution environment
#[derive(Debug, Clone)]
pub struct PreinstalledProvisioner {
    configured: Option<PathBuf>,
    chrome_path: Option<PathBuf>,
    search_path: Option<OsString>,
}

impl PreinstalledProvisioner {
    pub fn new(
        configured: Option<PathBuf>,
        chrome_path: Option<PathBuf>,
        search_path: Option<OsString>,
    ) -> Self {
        Self {
            configured,
            chrome_path,
            search_path,
        }
    }

    /// Look up `CHROME_PATH` and `PATH` from the process environment
    pub fn from_env(configured: Option<PathBuf>) -> Self {
        Self::new(
            configured,
            std::env::var_os("CHROME_PATH").map(PathBuf::from),
            std::env::var_os("PATH"),
        )
    }

    /// Candidate executables in lookup order
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = self
            .configured
            .iter()
            .chain(self.chrome_path.iter())
            .filter(|p| !p.as_os_str().is_empty())
            .cloned()
            .collect();

        if let Some(search_path) = &self.search_path {
            for name in PREINSTALLED_NAMES {
                for dir in std::env::split_paths(search_path) {
                    candidates.push(dir.join(name));
                }
            }
        }
        candidates
    }
}

#[async_trait]
impl BrowserProvisioner for PreinstalledProvisioner {
    fn strategy(&self) -> BrowserStrategy {
        BrowserStrategy::Preinstalled
    }

    async fn provision(&self) -> RunResult<BrowserLauncher> {
        let candidates = self.candidates();
        match candidates.iter().find(|c| c.is_file()) {
            Some(executable) => {
                info!("Using preinstalled browser at {}", executable.display());
                Ok(BrowserLauncher::with_args(executable.clone(), HEADLESS_ARGS))
            }
            None => Err(RunError::BrowserNotFound(
                candidates
                    .iter()
                    .map(|c| c.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }
}

/// Browser shipped with the deployment artifact
#[derive(Debug, Clone)]
pub struct BundledProvisioner {
    executable: PathBuf,
}

impl BundledProvisioner {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl BrowserProvisioner for BundledProvisioner {
    fn strategy(&self) -> BrowserStrategy {
        BrowserStrategy::Bundled
    }

    async fn provision(&self) -> RunResult<BrowserLauncher> {
        if !self.executable.is_file() {
            return Err(RunError::BrowserNotFound(
                self.executable.display().to_string(),
            ));
        }
        info!("Using bundled browser at {}", self.executable.display());
        Ok(BrowserLauncher::with_args(self.executable.clone(), SANDBOXED_ARGS))
    }
}

/// Installs a browser launcher package into scratch space on first use
#[derive(Debug, Clone)]
pub struct OnDemandProvisioner {
    install: InstallConfig,
}

impl OnDemandProvisioner {
    pub fn new(install: InstallConfig) -> Self {
        Self { install }
    }

    /// Throwaway manifest naming the launcher dependency
    pub fn manifest(&self) -> serde_json::Value {
        let mut dependencies = serde_json::Map::new();
        dependencies.insert(
            self.install.package.clone(),
            serde_json::Value::String(self.install.version.clone()),
        );
        serde_json::json!({
            "name": "suiterun-browser",
            "version": "0.0.0",
            "private": true,
            "dependencies": dependencies,
        })
    }

    /// Command with the home and npm cache directories redirected into scratch space
    fn scratch_command(&self, program: &str) -> Command {
        let scratch = &self.install.scratch_dir;
        let mut cmd = Command::new(program);
        cmd.current_dir(scratch)
            .env("HOME", scratch)
            .env("npm_config_cache", scratch.join(".npm"))
            .env("npm_config_update_notifier", "false")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn install_package(&self) -> RunResult<()> {
        let scratch = &self.install.scratch_dir;
        tokio::fs::create_dir_all(scratch).await?;
        tokio::fs::write(
            scratch.join("package.json"),
            serde_json::to_vec_pretty(&self.manifest())?,
        )
        .await?;

        info!(
            "Installing {}@{} into {}",
            self.install.package,
            self.install.version,
            scratch.display()
        );

        let output = self
            .scratch_command(&self.install.npm_binary)
            .args(["install", "--no-audit", "--no-fund", "--omit=dev"])
            .output()
            .await
            .map_err(|e| {
                RunError::Provisioning(format!(
                    "failed to run {}: {}",
                    self.install.npm_binary, e
                ))
            })?;

        if !output.status.success() {
            return Err(RunError::Provisioning(format!(
                "npm install exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn locate_executable(&self) -> RunResult<BrowserLauncher> {
        let output = self
            .scratch_command(&self.install.node_binary)
            .arg("-e")
            .arg(LOCATE_SCRIPT)
            .arg(&self.install.package)
            .output()
            .await
            .map_err(|e| {
                RunError::Provisioning(format!(
                    "failed to run {}: {}",
                    self.install.node_binary, e
                ))
            })?;

        if !output.status.success() {
            return Err(RunError::Provisioning(format!(
                "could not load {}: {}",
                self.install.package,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("Launcher package reported {}", stdout.trim());
        parse_located(&stdout, &self.install.scratch_dir)
    }
}

/// Parse the locate script's output into a launcher
fn parse_located(stdout: &str, scratch_dir: &Path) -> RunResult<BrowserLauncher> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Located {
        executable_path: Option<String>,
        #[serde(default)]
        args: Vec<String>,
    }

    let located: Located = serde_json::from_str(stdout.trim())?;
    let executable = located
        .executable_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            RunError::Provisioning("launcher package reported no executable path".to_string())
        })?;

    let args = if located.args.is_empty() {
        SANDBOXED_ARGS.iter().map(|a| a.to_string()).collect()
    } else {
        located.args
    };

    Ok(BrowserLauncher {
        executable: PathBuf::from(executable),
        args,
        env: vec![("HOME".to_string(), scratch_dir.display().to_string())],
    })
}

#[async_trait]
impl BrowserProvisioner for OnDemandProvisioner {
    fn strategy(&self) -> BrowserStrategy {
        BrowserStrategy::OnDemand
    }

    async fn provision(&self) -> RunResult<BrowserLauncher> {
        self.install_package().await?;
        let launcher = self.locate_executable().await?;
        info!("Installed browser at {}", launcher.executable.display());
        Ok(launcher)
    }
}

/// Build the provisioner selected by configuration
pub fn provisioner_for(config: &BrowserConfig) -> Arc<dyn BrowserProvisioner> {
    match config.strategy {
        BrowserStrategy::Preinstalled => Arc::new(PreinstalledProvisioner::from_env(
            config.executable_path.clone(),
        )),
        BrowserStrategy::Bundled => Arc::new(BundledProvisioner::new(
            config
                .executable_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUNDLED_PATH)),
        )),
        BrowserStrategy::OnDemand => Arc::new(OnDemandProvisioner::new(config.install.clone())),
    }
}

type Provisioned = Result<Arc<BrowserLauncher>, String>;

/// Process-lifetime provisioning state.
///
/// The first call to `launcher` provisions; later calls, including after a
/// failure, get the memoized result. The provisioning pass runs on its own
/// task, so a caller that gives up does not abandon an install halfway.
pub struct ProvisionContext {
    provisioner: Arc<dyn BrowserProvisioner>,
    launcher: Arc<OnceCell<Provisioned>>,
}

impl ProvisionContext {
    pub fn new(provisioner: Arc<dyn BrowserProvisioner>) -> Self {
        Self {
            provisioner,
            launcher: Arc::new(OnceCell::new()),
        }
    }

    pub fn from_config(config: &BrowserConfig) -> Self {
        Self::new(provisioner_for(config))
    }

    pub fn strategy(&self) -> BrowserStrategy {
        self.provisioner.strategy()
    }

    pub fn is_provisioned(&self) -> bool {
        self.launcher.initialized()
    }

    pub async fn launcher(&self) -> RunResult<Arc<BrowserLauncher>> {
        let result = match self.launcher.get() {
            Some(result) => result.clone(),
            None => {
                let cell = self.launcher.clone();
                let provisioner = self.provisioner.clone();
                tokio::spawn(async move {
                    cell.get_or_init(|| provision_once(provisioner)).await.clone()
                })
                .await
                .map_err(|e| RunError::Provisioning(format!("provisioning task failed: {}", e)))?
            }
        };

        result.map_err(RunError::Provisioning)
    }
}

async fn provision_once(provisioner: Arc<dyn BrowserProvisioner>) -> Provisioned {
    info!("Provisioning browser ({})", provisioner.strategy());
    provisioner.provision().await.map(Arc::new).map_err(|e| {
        error!("Browser provisioning failed: {}", e);
        e.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvisioner {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BrowserProvisioner for CountingProvisioner {
        fn strategy(&self) -> BrowserStrategy {
            BrowserStrategy::OnDemand
        }

        async fn provision(&self) -> RunResult<BrowserLauncher> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RunError::Provisioning("npm install exited with 1".to_string()))
            } else {
                Ok(BrowserLauncher::with_args(PathBuf::from("/bin/chromium"), HEADLESS_ARGS))
            }
        }
    }

    #[tokio::test]
    async fn test_provisioning_is_memoized() {
        let provisioner = Arc::new(CountingProvisioner {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let context = ProvisionContext::new(provisioner.clone());
        assert!(!context.is_provisioned());

        let first = context.launcher().await.unwrap();
        let second = context.launcher().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 1);
        assert!(context.is_provisioned());
    }

    #[tokio::test]
    async fn test_failure_is_not_retried() {
        let provisioner = Arc::new(CountingProvisioner {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let context = ProvisionContext::new(provisioner.clone());

        for _ in 0..3 {
            let err = context.launcher().await.unwrap_err();
            assert_eq!(err.kind(), "provisioning");
        }
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_restart_provisioning() {
        struct SlowProvisioner {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl BrowserProvisioner for SlowProvisioner {
            fn strategy(&self) -> BrowserStrategy {
                BrowserStrategy::OnDemand
            }

            async fn provision(&self) -> RunResult<BrowserLauncher> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok(BrowserLauncher::with_args(PathBuf::from("/bin/chromium"), HEADLESS_ARGS))
            }
        }

        let provisioner = Arc::new(SlowProvisioner {
            calls: AtomicUsize::new(0),
        });
        let context = ProvisionContext::new(provisioner.clone());

        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(20), context.launcher()).await;
        assert!(abandoned.is_err());

        let launcher = context.launcher().await.unwrap();
        assert_eq!(launcher.executable, PathBuf::from("/bin/chromium"));
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preinstalled_lookup_order() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("google-chrome"), "").unwrap();

        let provisioner = PreinstalledProvisioner::new(
            Some(dir.path().join("missing-chrome")),
            None,
            Some(bin.clone().into_os_string()),
        );
        let candidates = provisioner.candidates();
        assert_eq!(candidates[0], dir.path().join("missing-chrome"));

        let launcher = provisioner.provision().await.unwrap();
        assert_eq!(launcher.executable, bin.join("google-chrome"));
        assert!(launcher.args.contains(&"--headless".to_string()));
    }

    #[tokio::test]
    async fn test_preinstalled_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner =
            PreinstalledProvisioner::new(None, None, Some(dir.path().as_os_str().to_owned()));
        let err = provisioner.provision().await.unwrap_err();
        assert_eq!(err.kind(), "browser_not_found");
    }

    #[tokio::test]
    async fn test_bundled_uses_sandboxed_flags() {
        let dir = tempfile::tempdir().unwrap();
        let chromium = dir.path().join("chromium");
        std::fs::write(&chromium, "").unwrap();

        let launcher = BundledProvisioner::new(&chromium).provision().await.unwrap();
        for flag in ["--disable-dev-shm-usage", "--disable-gpu", "--enable-automation", "--no-sandbox"] {
            assert!(launcher.args.iter().any(|a| a == flag), "missing {}", flag);
        }
    }

    #[test]
    fn test_manifest_names_dependency() {
        let provisioner = OnDemandProvisioner::new(InstallConfig {
            package: "chrome-aws-lambda".to_string(),
            version: "^2.1.1".to_string(),
            ..Default::default()
        });
        let manifest = provisioner.manifest();
        assert_eq!(manifest["dependencies"]["chrome-aws-lambda"], "^2.1.1");
        assert_eq!(manifest["private"], true);
    }

    #[test]
    fn test_parse_located() {
        let scratch = Path::new("/tmp/suiterun/browser");
        let launcher = parse_located(
            r#"{"executablePath":"/tmp/chromium","args":["--single-process"]}"#,
            scratch,
        )
        .unwrap();
        assert_eq!(launcher.executable, PathBuf::from("/tmp/chromium"));
        assert_eq!(launcher.args, vec!["--single-process"]);
        assert_eq!(launcher.env, vec![("HOME".to_string(), "/tmp/suiterun/browser".to_string())]);

        let defaulted = parse_located(r#"{"executablePath":"/tmp/chromium"}"#, scratch).unwrap();
        assert!(defaulted.args.contains(&"--disable-dev-shm-usage".to_string()));

        assert!(parse_located(r#"{"executablePath":null}"#, scratch).is_err());
    }

    #[tokio::test]
    async fn test_missing_npm_is_provisioning_error() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = OnDemandProvisioner::new(InstallConfig {
            scratch_dir: dir.path().join("browser"),
            npm_binary: "/nonexistent/npm".to_string(),
            ..Default::default()
        });
        let err = provisioner.provision().await.unwrap_err();
        assert_eq!(err.kind(), "provisioning");
        assert!(dir.path().join("browser/package.json").exists());
    }
}
