//! Test-automation server management
//!
//! The automation framework runs inside a small Node.js bridge process.
//! Commands go to its stdin and events come back on stdout as one JSON
//! object per line:
//!
//! ```text
//! -> {"cmd":"connect"}                      <- {"event":"connection","id":..,"url":..}
//!                                           <- {"event":"ready","connection":..}
//! -> {"cmd":"run","run":1,"src":..,"connection":..}
//!                                           <- {"event":"report","run":1,"chunk":<base64>}
//!                                           <- {"event":"done","run":1,"failed":0}
//! -> {"cmd":"close"}                        <- {"event":"closed"}
//! ```

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use suiterun_common::ServerConfig;

use crate::error::{RunError, RunResult};
use crate::process::stop_child;
use crate::report::ReportCollector;

const BRIDGE_SCRIPT: &str = include_str!("../assets/bridge.js");

/// One negotiated link between the automation server and a browser
#[derive(Debug)]
pub struct ServerConnection {
    id: String,
    url: String,
    ready: Option<oneshot::Receiver<()>>,
}

impl ServerConnection {
    pub fn new(id: impl Into<String>, url: impl Into<String>, ready: oneshot::Receiver<()>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            ready: Some(ready),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// URL the browser must open to join the server
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Take the readiness signal; resolves once the browser has connected
    pub fn take_ready(&mut self) -> Option<oneshot::Receiver<()>> {
        self.ready.take()
    }
}

/// A running test-automation server
#[async_trait]
pub trait AutomationServer: Send {
    /// Create the browser connection object tests will run against
    async fn create_browser_connection(&mut self) -> RunResult<ServerConnection>;

    /// Run one test file, feeding structured reporter output into `report`.
    /// Returns the number of failed tests.
    async fn run_file(
        &mut self,
        connection: &ServerConnection,
        file: &Path,
        report: &mut ReportCollector,
    ) -> RunResult<u32>;

    async fn close(self: Box<Self>) -> RunResult<()>;
}

/// Starts automation servers
#[async_trait]
pub trait AutomationServerFactory: Send + Sync {
    async fn start(&self) -> RunResult<Box<dyn AutomationServer>>;
}

/// Commands written to the bridge
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    Connect,
    Run {
        run: u64,
        src: &'a Path,
        connection: &'a str,
    },
    Close,
}

/// Events read from the bridge
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Started,
    Connection { id: String, url: String },
    Ready { connection: String },
    Report { run: u64, chunk: String },
    Done { run: u64, failed: u32 },
    Error { run: Option<u64>, message: String },
    Closed,
    Fatal { message: String },
}

/// Bridge events after readiness routing and chunk decoding
#[derive(Debug)]
enum BridgeMessage {
    Started,
    Connection(ServerConnection),
    Report { run: u64, chunk: Vec<u8> },
    Done { run: u64, failed: u32 },
    Error { run: Option<u64>, message: String },
    Closed,
    Fatal(String),
}

fn parse_event(line: &str) -> Option<BridgeEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Starts `NodeBridge` processes
pub struct NodeBridgeFactory {
    config: ServerConfig,
}

impl NodeBridgeFactory {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AutomationServerFactory for NodeBridgeFactory {
    async fn start(&self) -> RunResult<Box<dyn AutomationServer>> {
        Ok(Box::new(NodeBridge::spawn(&self.config).await?))
    }
}

/// Handle to a running bridge process
pub struct NodeBridge {
    child: Child,
    stdin: ChildStdin,
    events: mpsc::UnboundedReceiver<BridgeMessage>,
    next_run: u64,
    shutdown_timeout: Duration,
    _script_dir: TempDir,
}

impl NodeBridge {
    /// Spawn the bridge and wait until the automation server is listening
    pub async fn spawn(config: &ServerConfig) -> RunResult<Self> {
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        tokio::fs::write(&script_path, BRIDGE_SCRIPT).await?;

        info!(
            "Starting automation server on {}:{}/{}",
            config.host, config.ports[0], config.ports[1]
        );

        let mut cmd = Command::new(&config.node_binary);
        cmd.arg(&script_path)
            .env("SUITERUN_HOST", &config.host)
            .env("SUITERUN_PORT1", config.ports[0].to_string())
            .env("SUITERUN_PORT2", config.ports[1].to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(node_path) = &config.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RunError::ServerStartup(format!("Failed to spawn {}: {}", config.node_binary, e))
        })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(RunError::ServerStartup(
                    "bridge process has no stdio pipes".to_string(),
                ))
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(stdout, tx));
        tokio::spawn(forward_stderr(stderr));

        let mut bridge = NodeBridge {
            child,
            stdin,
            events: rx,
            next_run: 0,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            _script_dir: script_dir,
        };

        bridge
            .wait_for_started(Duration::from_secs(config.startup_timeout_secs))
            .await?;

        info!("Automation server started");
        Ok(bridge)
    }

    async fn wait_for_started(&mut self, timeout_duration: Duration) -> RunResult<()> {
        let started = timeout(timeout_duration, async {
            loop {
                match self.events.recv().await {
                    Some(BridgeMessage::Started) => return Ok(()),
                    Some(BridgeMessage::Fatal(message)) => {
                        return Err(RunError::ServerStartup(message))
                    }
                    Some(other) => debug!("Ignoring bridge event before start: {:?}", other),
                    None => {
                        return Err(RunError::ServerStartup(
                            "bridge exited before the server started".to_string(),
                        ))
                    }
                }
            }
        })
        .await;

        match started {
            Ok(result) => result,
            Err(_) => Err(RunError::ServerStartup(format!(
                "server did not start within {}s",
                timeout_duration.as_secs()
            ))),
        }
    }

    async fn send(&mut self, command: &BridgeCommand<'_>) -> RunResult<()> {
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        debug!("-> bridge: {:?}", command);

        let written = async {
            self.stdin.write_all(&line).await?;
            self.stdin.flush().await
        };
        written
            .await
            .map_err(|e| RunError::ServerExited(format!("bridge stdin closed: {}", e)))
    }
}

#[async_trait]
impl AutomationServer for NodeBridge {
    async fn create_browser_connection(&mut self) -> RunResult<ServerConnection> {
        self.send(&BridgeCommand::Connect).await?;

        loop {
            match self.events.recv().await {
                Some(BridgeMessage::Connection(connection)) => {
                    info!("Automation server accepts browsers at {}", connection.url());
                    return Ok(connection);
                }
                Some(BridgeMessage::Error { run: None, message }) => {
                    return Err(RunError::Connection(message))
                }
                Some(BridgeMessage::Fatal(message)) => return Err(RunError::ServerExited(message)),
                Some(other) => debug!("Ignoring bridge event: {:?}", other),
                None => {
                    return Err(RunError::ServerExited(
                        "bridge exited while creating a browser connection".to_string(),
                    ))
                }
            }
        }
    }

    async fn run_file(
        &mut self,
        connection: &ServerConnection,
        file: &Path,
        report: &mut ReportCollector,
    ) -> RunResult<u32> {
        self.next_run += 1;
        let run = self.next_run;
        self.send(&BridgeCommand::Run {
            run,
            src: file,
            connection: connection.id(),
        })
        .await?;

        loop {
            match self.events.recv().await {
                Some(BridgeMessage::Report { run: r, chunk }) if r == run => report.push(&chunk),
                Some(BridgeMessage::Done { run: r, failed }) if r == run => return Ok(failed),
                Some(BridgeMessage::Error { run: Some(r), message }) if r == run => {
                    return Err(RunError::TestRun {
                        file: file.to_path_buf(),
                        reason: message,
                    })
                }
                Some(BridgeMessage::Fatal(message)) => return Err(RunError::ServerExited(message)),
                Some(other) => debug!("Ignoring bridge event during run {}: {:?}", run, other),
                None => {
                    return Err(RunError::ServerExited(format!(
                        "bridge exited while running {}",
                        file.display()
                    )))
                }
            }
        }
    }

    async fn close(self: Box<Self>) -> RunResult<()> {
        let mut bridge = *self;
        info!("Closing automation server");

        if bridge.send(&BridgeCommand::Close).await.is_ok() {
            let grace = bridge.shutdown_timeout;
            let closed = timeout(grace, async {
                while let Some(message) = bridge.events.recv().await {
                    if matches!(message, BridgeMessage::Closed) {
                        break;
                    }
                }
            })
            .await;
            if closed.is_err() {
                warn!("Automation server did not close within {}s", grace.as_secs());
            }
        }

        if bridge.child.try_wait()?.is_none() {
            stop_child(&mut bridge.child, bridge.shutdown_timeout).await;
        }
        Ok(())
    }
}

/// Read bridge stdout, route readiness signals and forward everything else
async fn pump_events(stdout: ChildStdout, tx: mpsc::UnboundedSender<BridgeMessage>) {
    let mut pending: HashMap<String, oneshot::Sender<()>> = HashMap::new();
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read bridge output: {}", e);
                break;
            }
        };

        let Some(event) = parse_event(&line) else {
            debug!("[bridge] {}", line);
            continue;
        };

        let message = match event {
            BridgeEvent::Started => BridgeMessage::Started,
            BridgeEvent::Connection { id, url } => {
                let (ready_tx, ready_rx) = oneshot::channel();
                pending.insert(id.clone(), ready_tx);
                BridgeMessage::Connection(ServerConnection::new(id, url, ready_rx))
            }
            BridgeEvent::Ready { connection } => {
                match pending.remove(&connection) {
                    Some(ready) => {
                        let _ = ready.send(());
                    }
                    None => debug!("Ready signal for unknown connection {}", connection),
                }
                continue;
            }
            BridgeEvent::Report { run, chunk } => match STANDARD.decode(chunk.as_bytes()) {
                Ok(chunk) => BridgeMessage::Report { run, chunk },
                Err(e) => BridgeMessage::Error {
                    run: Some(run),
                    message: format!("undecodable report chunk: {}", e),
                },
            },
            BridgeEvent::Done { run, failed } => BridgeMessage::Done { run, failed },
            BridgeEvent::Error { run, message } => BridgeMessage::Error { run, message },
            BridgeEvent::Closed => BridgeMessage::Closed,
            BridgeEvent::Fatal { message } => BridgeMessage::Fatal(message),
        };

        if tx.send(message).is_err() {
            break;
        }
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[automation] {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events() {
        assert_eq!(parse_event(r#"{"event":"started"}"#), Some(BridgeEvent::Started));
        assert_eq!(
            parse_event(r#"{"event":"connection","id":"abc","url":"http://localhost:1337/browser/connect/abc"}"#),
            Some(BridgeEvent::Connection {
                id: "abc".to_string(),
                url: "http://localhost:1337/browser/connect/abc".to_string(),
            })
        );
        assert_eq!(
            parse_event(r#"{"event":"error","run":null,"message":"x"}"#),
            Some(BridgeEvent::Error {
                run: None,
                message: "x".to_string(),
            })
        );
        assert_eq!(
            parse_event(r#" {"event":"done","run":3,"failed":1} "#),
            Some(BridgeEvent::Done { run: 3, failed: 1 })
        );
    }

    #[test]
    fn test_non_protocol_lines_are_ignored() {
        assert_eq!(parse_event("Running tests in:"), None);
        assert_eq!(parse_event(r#"{"event":"unknown"}"#), None);
        assert_eq!(parse_event(""), None);
    }

    #[test]
    fn test_command_wire_shape() {
        let run = BridgeCommand::Run {
            run: 2,
            src: Path::new("/tmp/a.js"),
            connection: "abc",
        };
        assert_eq!(
            serde_json::to_value(&run).unwrap(),
            serde_json::json!({"cmd": "run", "run": 2, "src": "/tmp/a.js", "connection": "abc"})
        );
        assert_eq!(
            serde_json::to_string(&BridgeCommand::Connect).unwrap(),
            r#"{"cmd":"connect"}"#
        );
    }

    #[test]
    fn test_bridge_script_speaks_protocol() {
        for event in ["started", "connection", "ready", "report", "done", "closed", "fatal"] {
            assert!(
                BRIDGE_SCRIPT.contains(&format!("event: '{}'", event)),
                "bridge script never emits {}",
                event
            );
        }
    }

    #[tokio::test]
    async fn test_missing_node_binary_is_startup_error() {
        let config = ServerConfig {
            node_binary: "/nonexistent/suiterun-node".to_string(),
            ..Default::default()
        };
        let err = NodeBridge::spawn(&config).await.err().unwrap();
        assert_eq!(err.kind(), "server_startup");
    }
}
