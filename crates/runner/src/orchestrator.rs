//! Run orchestration
//!
//! One run resolves its references, starts an automation server, connects
//! a freshly launched headless browser to it, executes each file in order
//! and always tears both down again.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use suiterun_common::{Config, FileReport, RunOutcome, RunReport, TestReference};

use crate::browser::{BrowserHandle, BrowserLaunch, ChromeLauncher};
use crate::error::{RunError, RunResult};
use crate::provision::ProvisionContext;
use crate::report::{ReportCollector, ResultAggregator};
use crate::resolver::{ResolvedSuite, TestFileResolver};
use crate::server::{AutomationServer, AutomationServerFactory, NodeBridgeFactory, ServerConnection};

/// Drives runs against injected server, browser and provisioning seams
pub struct Orchestrator {
    resolver: TestFileResolver,
    servers: Arc<dyn AutomationServerFactory>,
    browsers: Arc<dyn BrowserLaunch>,
    provisioning: Arc<ProvisionContext>,
    /// Deadline for the readiness handshake; `None` waits forever
    readiness_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        resolver: TestFileResolver,
        servers: Arc<dyn AutomationServerFactory>,
        browsers: Arc<dyn BrowserLaunch>,
        provisioning: Arc<ProvisionContext>,
    ) -> Self {
        Self {
            resolver,
            servers,
            browsers,
            provisioning,
            readiness_timeout: None,
        }
    }

    /// Production wiring: node bridge, Chromium and the shared provisioning context
    pub fn from_config(config: &Config, provisioning: Arc<ProvisionContext>) -> RunResult<Self> {
        let resolver = TestFileResolver::from_config(config)?;
        let servers = Arc::new(NodeBridgeFactory::new(config.server.clone()));
        let browsers = Arc::new(ChromeLauncher::new(
            Duration::from_secs(config.browser.launch_timeout_secs),
            config.browser.extra_args.clone(),
        ));
        Ok(Self::new(resolver, servers, browsers, provisioning)
            .with_readiness_timeout(config.readiness_timeout()))
    }

    pub fn with_readiness_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn resolver(&self) -> &TestFileResolver {
        &self.resolver
    }

    pub fn provisioning(&self) -> &ProvisionContext {
        &self.provisioning
    }

    /// Run the references and convert any run-level failure into an outcome
    pub async fn run(&self, references: &[TestReference], cancel: CancellationToken) -> RunOutcome {
        ResultAggregator::outcome(self.run_report(references, cancel).await)
    }

    /// Run the references, returning run-level failures as errors
    pub async fn run_report(
        &self,
        references: &[TestReference],
        cancel: CancellationToken,
    ) -> RunResult<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);

        async move {
            let start = Instant::now();
            info!("Starting run with {} reference(s)", references.len());

            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let suite = until_cancelled(&cancel, self.resolver.resolve(references)).await?;
            let mut server = until_cancelled(&cancel, self.servers.start()).await??;
            let mut browser: Option<Box<dyn BrowserHandle>> = None;

            let result = self
                .drive(server.as_mut(), &mut browser, &suite, &cancel)
                .await;

            teardown(server, browser).await;

            if result.is_ok() {
                info!("Run finished in {}ms", start.elapsed().as_millis());
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Everything between server start and teardown
    async fn drive(
        &self,
        server: &mut dyn AutomationServer,
        browser: &mut Option<Box<dyn BrowserHandle>>,
        suite: &ResolvedSuite,
        cancel: &CancellationToken,
    ) -> RunResult<RunReport> {
        let mut connection =
            until_cancelled(cancel, server.create_browser_connection()).await??;

        let launcher = until_cancelled(cancel, self.provisioning.launcher()).await??;
        let launched = until_cancelled(cancel, self.browsers.launch(&launcher)).await??;
        let handle = browser.insert(launched);

        match handle.user_agent().await {
            Ok(user_agent) => info!("Browser started: {}", user_agent),
            Err(e) => warn!("Could not read browser user agent: {}", e),
        }

        self.connect(handle.as_mut(), &mut connection, cancel).await?;
        info!("Browser connected to the automation server");

        execute(server, &connection, suite, cancel).await
    }

    /// Readiness handshake, bounded by the configured deadline
    async fn connect(
        &self,
        browser: &mut dyn BrowserHandle,
        connection: &mut ServerConnection,
        cancel: &CancellationToken,
    ) -> RunResult<()> {
        let mut ready = connection
            .take_ready()
            .ok_or_else(|| RunError::Connection("readiness signal already consumed".to_string()))?;
        let url = connection.url().to_string();

        let handshake = async {
            let navigate = browser.open_page(&url);
            tokio::pin!(navigate);
            let mut navigated = false;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RunError::Cancelled),
                    signal = &mut ready => {
                        return signal.map_err(|_| {
                            RunError::ServerExited(
                                "connection dropped before the browser was ready".to_string(),
                            )
                        });
                    }
                    opened = &mut navigate, if !navigated => {
                        opened?;
                        navigated = true;
                    }
                }
            }
        };

        match self.readiness_timeout {
            Some(deadline) => tokio::time::timeout(deadline, handshake)
                .await
                .map_err(|_| RunError::ReadinessTimeout {
                    seconds: deadline.as_secs(),
                })?,
            None => handshake.await,
        }
    }
}

/// Run every resolved file in order, isolating per-file failures
async fn execute(
    server: &mut dyn AutomationServer,
    connection: &ServerConnection,
    suite: &ResolvedSuite,
    cancel: &CancellationToken,
) -> RunResult<RunReport> {
    let mut aggregator = ResultAggregator::new();

    for file in suite.files() {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        info!("Running {}", file.reference);
        let mut collector = ReportCollector::new(&file.path);

        let ran = until_cancelled(
            cancel,
            server.run_file(connection, &file.path, &mut collector),
        )
        .await?;

        let report = match ran.and_then(|failed| {
            if failed > 0 {
                info!("{} test(s) failed in {}", failed, file.reference);
            }
            collector.finish()
        }) {
            Ok(report) => report,
            Err(e) if e.is_run_fatal() => return Err(e),
            Err(e) => {
                warn!("Recording {} as not passed: {}", file.reference, e);
                FileReport::NotPassed
            }
        };

        aggregator.record(&file.reference, report);
    }

    Ok(aggregator.finish())
}

/// Race `work` against cancellation
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = T>,
) -> RunResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        out = work => Ok(out),
    }
}

/// Close the server, then the browser; failures are logged and dropped
async fn teardown(server: Box<dyn AutomationServer>, browser: Option<Box<dyn BrowserHandle>>) {
    if let Err(e) = server.close().await {
        warn!("Failed to close automation server: {}", e);
    }
    if let Some(browser) = browser {
        if let Err(e) = browser.close().await {
            warn!("Failed to close browser: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFile, FakeRig, Fault, SLOW_PROVISIONING};
    use serde_json::json;
    use tempfile::TempDir;

    fn fixture(names: &[&str]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), "fixture`smoke`;").unwrap();
        }
        dir
    }

    fn orchestrator(rig: &FakeRig, dir: &TempDir) -> Orchestrator {
        let resolver = TestFileResolver::new(dir.path(), dir.path(), rig.fetcher());
        Orchestrator::new(
            resolver,
            rig.server_factory(),
            rig.browser_launch(),
            Arc::new(ProvisionContext::new(rig.provisioner())),
        )
        .with_readiness_timeout(Some(Duration::from_secs(5)))
    }

    fn refs(names: &[&str]) -> Vec<TestReference> {
        names.iter().map(|n| TestReference::from(*n)).collect()
    }

    fn assert_torn_down_once(rig: &FakeRig, browser_launched: bool) {
        assert_eq!(rig.count("server.close"), 1, "log: {:?}", rig.log());
        let expected = usize::from(browser_launched);
        assert_eq!(rig.count("browser.close"), expected, "log: {:?}", rig.log());
    }

    #[tokio::test]
    async fn test_reports_follow_input_order() {
        let dir = fixture(&["b.js", "a.js", "c.js"]);
        let rig = FakeRig::new()
            .with_file("a.js", FakeFile::Report(json!({"passed": 3})))
            .with_file("c.js", FakeFile::Silent);

        let report = orchestrator(&rig, &dir)
            .run_report(&refs(&["b.js", "a.js", "c.js"]), CancellationToken::new())
            .await
            .unwrap();

        let keys: Vec<&str> = report.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["b.js", "a.js", "c.js"]);
        assert_eq!(report.get("a.js"), Some(&FileReport::Json(json!({"passed": 3}))));
        assert_eq!(report.get("c.js"), Some(&FileReport::NotPassed));
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new();

        orchestrator(&rig, &dir)
            .run_report(&refs(&["a.js"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            rig.log(),
            vec![
                "server.start",
                "server.connection",
                "provision",
                "browser.launch /fake/chromium",
                "browser.open http://localhost:1337/browser/connect/fake",
                "server.run a.js",
                "server.close",
                "browser.close",
            ]
        );
    }

    #[tokio::test]
    async fn test_unresolved_references_give_empty_report() {
        let dir = fixture(&[]);
        let rig = FakeRig::new();

        let outcome = orchestrator(&rig, &dir)
            .run(&refs(&["missing-file.js"]), CancellationToken::new())
            .await;

        assert_eq!(outcome, RunOutcome::Completed(RunReport::new()));
        assert_eq!(rig.count("server.run"), 0);
        assert_torn_down_once(&rig, true);
    }

    #[tokio::test]
    async fn test_fetched_reference_keeps_its_url_key() {
        let dir = fixture(&[]);
        let url = "https://gist.example.com/raw/smoke.js";
        let rig = FakeRig::new().with_remote(url, "fixture`remote`;");

        let report = orchestrator(&rig, &dir)
            .run_report(&refs(&[url]), CancellationToken::new())
            .await
            .unwrap();

        assert!(report.get(url).unwrap().is_structured());
        assert_eq!(rig.count("fetch"), 1);
    }

    #[tokio::test]
    async fn test_server_start_failure_has_nothing_to_tear_down() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new().with_fault(Fault::ServerStart);

        let outcome = orchestrator(&rig, &dir)
            .run(&refs(&["a.js"]), CancellationToken::new())
            .await;

        assert!(outcome.is_failed());
        assert_eq!(rig.count("server.close"), 0);
        assert_eq!(rig.count("browser.launch"), 0);
    }

    #[tokio::test]
    async fn test_teardown_once_after_connection_failure() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new().with_fault(Fault::Connection);

        let err = orchestrator(&rig, &dir)
            .run_report(&refs(&["a.js"]), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "connection");
        assert_torn_down_once(&rig, false);
    }

    #[tokio::test]
    async fn test_teardown_once_after_provisioning_failure() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new().with_fault(Fault::Provisioning);

        let err = orchestrator(&rig, &dir)
            .run_report(&refs(&["a.js"]), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "provisioning");
        assert_torn_down_once(&rig, false);
    }

    #[tokio::test]
    async fn test_teardown_once_after_browser_launch_failure() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new().with_fault(Fault::BrowserLaunch);

        let err = orchestrator(&rig, &dir)
            .run_report(&refs(&["a.js"]), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "browser_launch");
        assert_torn_down_once(&rig, false);
    }

    #[tokio::test]
    async fn test_teardown_once_after_server_exit_mid_run() {
        let dir = fixture(&["a.js", "b.js", "c.js"]);
        let rig = FakeRig::new().with_file("b.js", FakeFile::ServerExit);

        let err = orchestrator(&rig, &dir)
            .run_report(&refs(&["a.js", "b.js", "c.js"]), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "server_exited");
        assert_eq!(rig.count("server.run c.js"), 0);
        assert_torn_down_once(&rig, true);
    }

    #[tokio::test]
    async fn test_file_failures_are_isolated() {
        let dir = fixture(&["a.js", "b.js", "c.js"]);
        let rig = FakeRig::new()
            .with_file("a.js", FakeFile::Crash("SyntaxError: Unexpected token".to_string()))
            .with_file("b.js", FakeFile::Garbled);

        let report = orchestrator(&rig, &dir)
            .run_report(&refs(&["a.js", "b.js", "c.js"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.get("a.js"), Some(&FileReport::NotPassed));
        assert_eq!(report.get("b.js"), Some(&FileReport::NotPassed));
        assert!(report.get("c.js").unwrap().is_structured());
        assert_torn_down_once(&rig, true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_deadline() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new().with_fault(Fault::NeverReady);

        let outcome = orchestrator(&rig, &dir)
            .run(&refs(&["a.js"]), CancellationToken::new())
            .await;

        match outcome {
            RunOutcome::Failed(failure) => assert_eq!(failure.kind, "readiness_timeout"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(rig.count("server.run"), 0);
        assert_torn_down_once(&rig, true);
    }

    #[tokio::test]
    async fn test_cancel_during_handshake() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new().with_fault(Fault::NeverReady);
        let orchestrator = orchestrator(&rig, &dir).with_readiness_timeout(None);

        let err = orchestrator
            .run_report(&refs(&["a.js"]), cancel_after(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "cancelled");
        assert_torn_down_once(&rig, true);
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test]
    async fn test_cancel_during_fetch() {
        let dir = fixture(&[]);
        let rig = FakeRig::new().with_fault(Fault::HangFetch);
        let cancel = cancel_after(Duration::from_millis(50));

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            orchestrator(&rig, &dir).run_report(&refs(&["https://example.com/slow.js"]), cancel),
        )
        .await
        .expect("run ignored cancellation")
        .unwrap_err();

        assert_eq!(err.kind(), "cancelled");
        assert_eq!(rig.count("fetch"), 1);
        assert_eq!(rig.count("server.start"), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_server_start() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new().with_fault(Fault::HangServerStart);
        let cancel = cancel_after(Duration::from_millis(50));

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            orchestrator(&rig, &dir).run_report(&refs(&["a.js"]), cancel),
        )
        .await
        .expect("run ignored cancellation")
        .unwrap_err();

        assert_eq!(err.kind(), "cancelled");
        assert_eq!(rig.count("server.close"), 0);
        assert_eq!(rig.count("browser.launch"), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_provisioning_keeps_single_provision() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new().with_fault(Fault::SlowProvisioning);
        let orchestrator = orchestrator(&rig, &dir);

        let err = orchestrator
            .run_report(&refs(&["a.js"]), cancel_after(SLOW_PROVISIONING / 4))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert_torn_down_once(&rig, false);

        let report = orchestrator
            .run_report(&refs(&["a.js"]), CancellationToken::new())
            .await
            .unwrap();
        assert!(report.get("a.js").unwrap().is_structured());
        assert_eq!(rig.count("provision"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator(&rig, &dir)
            .run_report(&refs(&["a.js"]), cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "cancelled");
        assert!(rig.log().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_fetch() {
        let dir = fixture(&[]);
        let url = "https://gist.example.com/raw/smoke.js";
        let rig = FakeRig::new().with_remote(url, "fixture`remote`;");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator(&rig, &dir)
            .run_report(&refs(&[url]), cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "cancelled");
        assert_eq!(rig.count("fetch"), 0);
    }

    #[tokio::test]
    async fn test_provisioning_shared_across_runs() {
        let dir = fixture(&["a.js"]);
        let rig = FakeRig::new();
        let orchestrator = orchestrator(&rig, &dir);

        for _ in 0..3 {
            let outcome = orchestrator
                .run(&refs(&["a.js"]), CancellationToken::new())
                .await;
            assert!(!outcome.is_failed());
        }

        assert_eq!(rig.count("provision"), 1);
        assert_eq!(rig.count("browser.launch"), 3);
        assert_eq!(rig.count("browser.close"), 3);
    }
}
