//! Function-as-a-service entry point
//!
//! `FunctionHandler` takes the raw invocation event of an API-gateway style
//! host, checks the token and runs the requested test files. Runs in one
//! process are serialized: the automation server binds fixed ports and a
//! run owns its browser connection exclusively.

use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use suiterun_common::{Config, FunctionResponse, OneOrMany, TestReference};
use suiterun_runner::{Orchestrator, ProvisionContext, ResultAggregator, RunResult};

/// Body returned when the invocation token is rejected
pub const INVALID_TOKEN: &str = "Token is invalid";

/// Invocation-level faults; these are not turned into responses
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Missing querystring parameters, ensure launch from API gateway proxy integration")]
    MissingQueryParameters,

    #[error("Malformed invocation: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Failed to build response: {0}")]
    Response(#[from] suiterun_common::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Invocation {
    query_string_parameters: Option<QueryParameters>,
    multi_value_query_string_parameters: Option<MultiValueParameters>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameters {
    token: Option<String>,
    test_files_paths: Option<OneOrMany>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiValueParameters {
    #[serde(default)]
    test_files_paths: Vec<String>,
}

pub struct FunctionHandler {
    orchestrator: Orchestrator,
    api_token: Option<String>,
    run_lock: Mutex<()>,
}

impl FunctionHandler {
    pub fn new(orchestrator: Orchestrator, api_token: Option<String>) -> Self {
        Self {
            orchestrator,
            api_token: api_token.filter(|t| !t.is_empty()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> RunResult<Self> {
        let provisioning = Arc::new(ProvisionContext::from_config(&config.browser));
        let orchestrator = Orchestrator::from_config(config, provisioning)?;
        Ok(Self::new(orchestrator, config.api_token.clone()))
    }

    pub async fn handle(
        &self,
        event: serde_json::Value,
    ) -> Result<FunctionResponse, InvocationError> {
        self.handle_with_cancel(event, CancellationToken::new()).await
    }

    /// Handle one invocation; `cancel` aborts the run, teardown still happens
    pub async fn handle_with_cancel(
        &self,
        event: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<FunctionResponse, InvocationError> {
        let invocation: Invocation = if event.is_null() {
            Invocation::default()
        } else {
            serde_json::from_value(event)?
        };

        let params = invocation
            .query_string_parameters
            .ok_or(InvocationError::MissingQueryParameters)?;

        if !self.token_matches(params.token.as_deref()) {
            warn!("Rejected invocation with an invalid token");
            return Ok(FunctionResponse::json(403, INVALID_TOKEN)?);
        }

        let references = match invocation.multi_value_query_string_parameters {
            Some(multi) if !multi.test_files_paths.is_empty() => {
                TestReference::many(OneOrMany::Many(multi.test_files_paths))
            }
            _ => params
                .test_files_paths
                .map(TestReference::many)
                .unwrap_or_default(),
        };

        let _run = self.run_lock.lock().await;
        info!("Invocation accepted for {} test file(s)", references.len());
        let outcome = self.orchestrator.run(&references, cancel).await;
        Ok(ResultAggregator::render(&outcome))
    }

    fn token_matches(&self, given: Option<&str>) -> bool {
        match (&self.api_token, given) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }
}
