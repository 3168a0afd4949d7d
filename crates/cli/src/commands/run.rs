//! Run test files once and report the outcome

use clap::Args;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use suiterun_common::{Config, RunOutcome, TestReference};
use suiterun_runner::{Orchestrator, ProvisionContext};

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct RunArgs {
    /// Test file paths or HTTP(S) URLs, run in the given order
    pub references: Vec<String>,

    /// Keep fetched test files after the run
    #[arg(long)]
    pub keep_fetched: bool,

    /// Seconds to wait for the browser to connect (0 waits forever)
    #[arg(long)]
    pub readiness_timeout: Option<u64>,
}

/// Run the references; returns whether the run failed
pub async fn execute(args: RunArgs, mut config: Config, format: OutputFormat) -> anyhow::Result<bool> {
    if args.keep_fetched {
        config.resolver.keep_fetched = true;
    }
    if let Some(secs) = args.readiness_timeout {
        config.run.readiness_timeout_secs = secs;
    }

    let provisioning = Arc::new(ProvisionContext::from_config(&config.browser));
    let orchestrator = Orchestrator::from_config(&config, provisioning)?;
    let references: Vec<TestReference> = args.references.into_iter().map(TestReference::from).collect();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let outcome = orchestrator.run(&references, cancel).await;
    info!("Run finished with status {}", outcome.status_code());

    match (&outcome, format) {
        (_, OutputFormat::Json) => output::print_json(&outcome),
        (RunOutcome::Completed(report), OutputFormat::Table) => {
            output::print_list(&output::report_rows(report), format)
        }
        (RunOutcome::Failed(failure), OutputFormat::Table) => output::print_failure(failure),
    }

    Ok(outcome.is_failed())
}
