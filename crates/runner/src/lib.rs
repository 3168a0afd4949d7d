//! Suiterun test runner
//!
//! Runs browser test files on demand:
//! - Resolves references (local paths or HTTP(S) URLs) into local files
//! - Provisions a headless browser once per process
//! - Starts the test-automation server through a Node.js bridge
//! - Runs each file in order and collects its JSON report
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Orchestrator                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  TestFileResolver   references -> ResolvedSuite              │
//! │  ProvisionContext   BrowserProvisioner -> BrowserLauncher    │
//! │  AutomationServer   NodeBridge (connect / run / close)       │
//! │  BrowserHandle      ChromeProcess (DevTools endpoint)        │
//! │  ResultAggregator   RunReport -> RunOutcome -> response      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod error;
pub mod orchestrator;
mod process;
pub mod provision;
pub mod report;
pub mod resolver;
pub mod server;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use browser::{BrowserHandle, BrowserLaunch, ChromeLauncher};
pub use error::{RunError, RunResult};
pub use orchestrator::Orchestrator;
pub use provision::{BrowserLauncher, BrowserProvisioner, ProvisionContext};
pub use report::{ReportCollector, ResultAggregator};
pub use resolver::{HttpFetcher, RemoteFetcher, ResolvedSuite, TestFileResolver};
pub use server::{AutomationServer, AutomationServerFactory, NodeBridgeFactory, ServerConnection};
