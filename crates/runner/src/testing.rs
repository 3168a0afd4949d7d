//! In-process fakes for the automation server, browser and provisioning seams
//!
//! A `FakeRig` hands out a server factory, a browser launcher, a provisioner
//! and a fetcher that all record into one shared call log, so tests can
//! assert on ordering and on how often each resource was closed.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use url::Url;

use suiterun_common::BrowserStrategy;

use crate::browser::{BrowserHandle, BrowserLaunch};
use crate::error::{RunError, RunResult};
use crate::provision::{BrowserLauncher, BrowserProvisioner};
use crate::report::ReportCollector;
use crate::resolver::RemoteFetcher;
use crate::server::{AutomationServer, AutomationServerFactory, ServerConnection};

/// Stage at which the rig fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    ServerStart,
    Connection,
    Provisioning,
    BrowserLaunch,
    /// The browser opens the page but the server never reports it connected
    NeverReady,
    /// Remote fetches never complete
    HangFetch,
    /// The automation server never finishes starting
    HangServerStart,
    /// Provisioning takes `SLOW_PROVISIONING` before it succeeds
    SlowProvisioning,
}

/// Duration of a provisioning pass under `Fault::SlowProvisioning`
pub const SLOW_PROVISIONING: std::time::Duration = std::time::Duration::from_millis(200);

/// How the fake server handles one test file
#[derive(Debug, Clone)]
pub enum FakeFile {
    /// Emit this JSON through the structured reporter
    Report(serde_json::Value),
    /// Finish without reporter output
    Silent,
    /// Emit bytes that are not valid JSON
    Garbled,
    /// Fail the run of this file
    Crash(String),
    /// The automation server dies while running this file
    ServerExit,
}

#[derive(Default)]
struct RigState {
    log: Mutex<Vec<String>>,
    faults: Mutex<Vec<Fault>>,
    files: Mutex<HashMap<String, FakeFile>>,
    remote: Mutex<HashMap<String, Bytes>>,
    pending_ready: Mutex<Option<oneshot::Sender<()>>>,
}

impl RigState {
    fn record(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.faults.lock().contains(&fault)
    }
}

/// Shared state behind every fake
#[derive(Clone, Default)]
pub struct FakeRig {
    state: Arc<RigState>,
}

impl FakeRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(self, fault: Fault) -> Self {
        self.state.faults.lock().push(fault);
        self
    }

    /// Script the behavior for files whose name is `name`
    pub fn with_file(self, name: &str, behavior: FakeFile) -> Self {
        self.state.files.lock().insert(name.to_string(), behavior);
        self
    }

    /// Serve `body` for `url` through the fake fetcher
    pub fn with_remote(self, url: &str, body: &str) -> Self {
        self.state
            .remote
            .lock()
            .insert(url.to_string(), Bytes::from(body.to_string()));
        self
    }

    /// Every call made against the fakes, in order
    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    /// Number of log entries starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .log
            .lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    pub fn server_factory(&self) -> Arc<dyn AutomationServerFactory> {
        Arc::new(FakeServerFactory {
            state: self.state.clone(),
        })
    }

    pub fn browser_launch(&self) -> Arc<dyn BrowserLaunch> {
        Arc::new(FakeBrowserLaunch {
            state: self.state.clone(),
        })
    }

    pub fn provisioner(&self) -> Arc<dyn BrowserProvisioner> {
        Arc::new(FakeProvisioner {
            state: self.state.clone(),
        })
    }

    pub fn fetcher(&self) -> Arc<dyn RemoteFetcher> {
        Arc::new(FakeFetcher {
            state: self.state.clone(),
        })
    }
}

struct FakeServerFactory {
    state: Arc<RigState>,
}

#[async_trait]
impl AutomationServerFactory for FakeServerFactory {
    async fn start(&self) -> RunResult<Box<dyn AutomationServer>> {
        self.state.record("server.start");
        if self.state.has_fault(Fault::HangServerStart) {
            std::future::pending::<()>().await;
        }
        if self.state.has_fault(Fault::ServerStart) {
            return Err(RunError::ServerStartup("port 1337 already in use".to_string()));
        }
        Ok(Box::new(FakeServer {
            state: self.state.clone(),
        }))
    }
}

struct FakeServer {
    state: Arc<RigState>,
}

#[async_trait]
impl AutomationServer for FakeServer {
    async fn create_browser_connection(&mut self) -> RunResult<ServerConnection> {
        self.state.record("server.connection");
        if self.state.has_fault(Fault::Connection) {
            return Err(RunError::Connection("no free connection slot".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        *self.state.pending_ready.lock() = Some(tx);
        Ok(ServerConnection::new(
            "fake",
            "http://localhost:1337/browser/connect/fake",
            rx,
        ))
    }

    async fn run_file(
        &mut self,
        _connection: &ServerConnection,
        file: &Path,
        report: &mut ReportCollector,
    ) -> RunResult<u32> {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.state.record(format!("server.run {}", name));

        let behavior = self
            .state
            .files
            .lock()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| FakeFile::Report(serde_json::json!({"total": 1, "passed": 1})));

        match behavior {
            FakeFile::Report(value) => {
                let bytes = serde_json::to_vec(&value)?;
                let (head, tail) = bytes.split_at(bytes.len() / 2);
                report.push(head);
                report.push(tail);
                Ok(0)
            }
            FakeFile::Silent => Ok(1),
            FakeFile::Garbled => {
                report.push(b"{\"total\":");
                Ok(0)
            }
            FakeFile::Crash(reason) => Err(RunError::TestRun {
                file: file.to_path_buf(),
                reason,
            }),
            FakeFile::ServerExit => Err(RunError::ServerExited("bridge process died".to_string())),
        }
    }

    async fn close(self: Box<Self>) -> RunResult<()> {
        self.state.record("server.close");
        Ok(())
    }
}

struct FakeBrowserLaunch {
    state: Arc<RigState>,
}

#[async_trait]
impl BrowserLaunch for FakeBrowserLaunch {
    async fn launch(&self, launcher: &BrowserLauncher) -> RunResult<Box<dyn BrowserHandle>> {
        self.state
            .record(format!("browser.launch {}", launcher.executable.display()));
        if self.state.has_fault(Fault::BrowserLaunch) {
            return Err(RunError::BrowserLaunch("browser exited during startup".to_string()));
        }
        Ok(Box::new(FakeBrowser {
            state: self.state.clone(),
        }))
    }
}

struct FakeBrowser {
    state: Arc<RigState>,
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn user_agent(&mut self) -> RunResult<String> {
        Ok("Mozilla/5.0 HeadlessChrome/119.0.0.0".to_string())
    }

    async fn open_page(&mut self, url: &str) -> RunResult<()> {
        self.state.record(format!("browser.open {}", url));
        if !self.state.has_fault(Fault::NeverReady) {
            if let Some(ready) = self.state.pending_ready.lock().take() {
                let _ = ready.send(());
            }
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> RunResult<()> {
        self.state.record("browser.close");
        Ok(())
    }
}

struct FakeProvisioner {
    state: Arc<RigState>,
}

#[async_trait]
impl BrowserProvisioner for FakeProvisioner {
    fn strategy(&self) -> BrowserStrategy {
        BrowserStrategy::Preinstalled
    }

    async fn provision(&self) -> RunResult<BrowserLauncher> {
        self.state.record("provision");
        if self.state.has_fault(Fault::SlowProvisioning) {
            tokio::time::sleep(SLOW_PROVISIONING).await;
        }
        if self.state.has_fault(Fault::Provisioning) {
            return Err(RunError::Provisioning("npm install exited with 1".to_string()));
        }
        Ok(BrowserLauncher {
            executable: PathBuf::from("/fake/chromium"),
            args: vec!["--headless".to_string()],
            env: Vec::new(),
        })
    }
}

struct FakeFetcher {
    state: Arc<RigState>,
}

#[async_trait]
impl RemoteFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> RunResult<Bytes> {
        self.state.record(format!("fetch {}", url));
        if self.state.has_fault(Fault::HangFetch) {
            std::future::pending::<()>().await;
        }
        self.state
            .remote
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| RunError::Fetch {
                url: url.to_string(),
                reason: "HTTP 404 Not Found".to_string(),
            })
    }
}
