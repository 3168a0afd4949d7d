//! Headless browser processes driven over the DevTools HTTP endpoint

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{RunError, RunResult};
use crate::process::stop_child;
use crate::provision::BrowserLauncher;

/// Handle to a running headless browser, owned by one run
#[async_trait]
pub trait BrowserHandle: Send {
    async fn user_agent(&mut self) -> RunResult<String>;

    /// Open a new page and navigate it to `url`
    async fn open_page(&mut self, url: &str) -> RunResult<()>;

    async fn close(self: Box<Self>) -> RunResult<()>;
}

/// Launches browsers from a provisioned launcher
#[async_trait]
pub trait BrowserLaunch: Send + Sync {
    async fn launch(&self, launcher: &BrowserLauncher) -> RunResult<Box<dyn BrowserHandle>>;
}

/// Launches Chromium-family browsers with a DevTools endpoint
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    launch_timeout: Duration,
    extra_args: Vec<String>,
}

impl ChromeLauncher {
    pub fn new(launch_timeout: Duration, extra_args: Vec<String>) -> Self {
        Self {
            launch_timeout,
            extra_args,
        }
    }
}

#[async_trait]
impl BrowserLaunch for ChromeLauncher {
    async fn launch(&self, launcher: &BrowserLauncher) -> RunResult<Box<dyn BrowserHandle>> {
        let process = ChromeProcess::spawn(launcher, &self.extra_args, self.launch_timeout).await?;
        Ok(Box::new(process))
    }
}

/// A headless Chromium child process
pub struct ChromeProcess {
    child: Child,
    endpoint: String,
    client: reqwest::Client,
    _profile: TempDir,
}

impl ChromeProcess {
    pub async fn spawn(
        launcher: &BrowserLauncher,
        extra_args: &[String],
        launch_timeout: Duration,
    ) -> RunResult<Self> {
        let port = find_free_port()?;
        let profile = tempfile::tempdir()?;

        info!(
            "Launching headless browser {} (DevTools port {})",
            launcher.executable.display(),
            port
        );

        let mut cmd = Command::new(&launcher.executable);
        cmd.args(&launcher.args)
            .args(extra_args.iter().filter(|a| !a.trim().is_empty()))
            .arg(format!("--remote-debugging-port={}", port))
            .arg("--remote-debugging-address=127.0.0.1")
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("about:blank")
            .envs(launcher.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            RunError::BrowserLaunch(format!(
                "Failed to spawn {}: {}",
                launcher.executable.display(),
                e
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        let mut process = ChromeProcess {
            child,
            endpoint: format!("http://127.0.0.1:{}", port),
            client,
            _profile: profile,
        };

        if let Err(e) = process.wait_for_devtools(launch_timeout).await {
            stop_child(&mut process.child, Duration::from_millis(500)).await;
            return Err(e);
        }

        Ok(process)
    }

    /// Poll the DevTools endpoint until it answers
    async fn wait_for_devtools(&mut self, timeout_duration: Duration) -> RunResult<()> {
        let version_url = format!("{}/json/version", self.endpoint);
        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Some(status) = self.child.try_wait()? {
                return Err(RunError::BrowserLaunch(format!(
                    "browser exited during startup ({})",
                    status
                )));
            }

            match self.client.get(&version_url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => warn!("DevTools endpoint returned {}", resp.status()),
                Err(e) => {
                    // Connection refused is expected while the browser starts
                    if !e.is_connect() {
                        debug!("DevTools probe error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(RunError::BrowserLaunch(format!(
            "DevTools endpoint not available after {} attempts",
            attempts
        )))
    }
}

#[async_trait]
impl BrowserHandle for ChromeProcess {
    async fn user_agent(&mut self) -> RunResult<String> {
        let version: serde_json::Value = self
            .client
            .get(format!("{}/json/version", self.endpoint))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(version
            .get("User-Agent")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    async fn open_page(&mut self, url: &str) -> RunResult<()> {
        debug!("Opening page at {}", url);
        self.client
            .put(format!("{}/json/new?{}", self.endpoint, url))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| RunError::Connection(format!("failed to open {}: {}", url, e)))?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> RunResult<()> {
        let mut process = *self;
        info!("Closing headless browser");
        stop_child(&mut process.child, Duration::from_secs(2)).await;
        Ok(())
    }
}

/// Find a free local port
fn find_free_port() -> std::io::Result<u16> {
    use std::net::TcpListener;

    Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}
