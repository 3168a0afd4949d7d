//! Provision the headless browser ahead of a run

use clap::Args;
use serde::Serialize;
use std::time::Duration;

use suiterun_common::{BrowserStrategy, Config};
use suiterun_runner::{BrowserLaunch, BrowserLauncher, ChromeLauncher, ProvisionContext};

use crate::output::{self, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ProvisionArgs {
    /// Override the configured provisioning strategy
    #[arg(long)]
    pub strategy: Option<BrowserStrategy>,

    /// Launch the provisioned browser once and report its user agent
    #[arg(long)]
    pub launch: bool,
}

#[derive(Debug, Serialize)]
pub struct ProvisionSummary {
    pub strategy: BrowserStrategy,
    #[serde(flatten)]
    pub launcher: BrowserLauncher,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl TableDisplay for ProvisionSummary {
    fn headers() -> Vec<&'static str> {
        vec!["Strategy", "Executable", "Flags", "User agent"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.strategy.to_string(),
            self.launcher.executable.display().to_string(),
            self.launcher.args.len().to_string(),
            self.user_agent.clone().unwrap_or_else(|| "-".to_string()),
        ]
    }
}

pub async fn execute(args: ProvisionArgs, mut config: Config, format: OutputFormat) -> anyhow::Result<()> {
    if let Some(strategy) = args.strategy {
        config.browser.strategy = strategy;
    }

    let context = ProvisionContext::from_config(&config.browser);
    let launcher = context.launcher().await?;

    let user_agent = if args.launch {
        let chrome = ChromeLauncher::new(
            Duration::from_secs(config.browser.launch_timeout_secs),
            config.browser.extra_args.clone(),
        );
        let mut browser = chrome.launch(&launcher).await?;
        let user_agent = browser.user_agent().await;
        browser.close().await?;
        Some(user_agent?)
    } else {
        None
    };

    output::print_item(
        &ProvisionSummary {
            strategy: context.strategy(),
            launcher: launcher.as_ref().clone(),
            user_agent,
        },
        format,
    );
    if format == OutputFormat::Table {
        output::print_success("Browser is ready");
    }
    Ok(())
}
