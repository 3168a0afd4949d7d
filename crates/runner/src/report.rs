//! Report capture and aggregation

use bytes::BytesMut;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use suiterun_common::{FileReport, FunctionResponse, RunFailure, RunOutcome, RunReport, TestReference};

use crate::error::{RunError, RunResult};

/// Accumulates the chunks the structured reporter writes for one test file
#[derive(Debug)]
pub struct ReportCollector {
    file: PathBuf,
    buffer: Option<BytesMut>,
}

impl ReportCollector {
    pub fn new(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            buffer: None,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(chunk);
    }

    /// Whether the reporter emitted anything, even an empty chunk
    pub fn has_output(&self) -> bool {
        self.buffer.is_some()
    }

    /// Parse the captured output; no output at all yields `NotPassed`
    pub fn finish(self) -> RunResult<FileReport> {
        match self.buffer {
            None => Ok(FileReport::NotPassed),
            Some(buffer) => serde_json::from_slice(&buffer)
                .map(FileReport::Json)
                .map_err(|e| RunError::Report {
                    file: self.file,
                    reason: e.to_string(),
                }),
        }
    }
}

/// Builds the ordered run report and renders outcomes for the function host
#[derive(Debug, Default)]
pub struct ResultAggregator {
    report: RunReport,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, reference: &TestReference, report: FileReport) {
        self.report.insert(reference.clone(), report);
    }

    pub fn len(&self) -> usize {
        self.report.len()
    }

    pub fn is_empty(&self) -> bool {
        self.report.is_empty()
    }

    pub fn finish(self) -> RunReport {
        self.report
    }

    /// Convert a run result into an outcome, logging run-level failures
    pub fn outcome(result: RunResult<RunReport>) -> RunOutcome {
        match result {
            Ok(report) => {
                info!("Run completed with {} report(s)", report.len());
                RunOutcome::Completed(report)
            }
            Err(e) => {
                error!("Unhandled run failure: {}", e);
                RunOutcome::Failed(RunFailure::from(&e))
            }
        }
    }

    /// Render an outcome as the function's HTTP-style response
    pub fn render(outcome: &RunOutcome) -> FunctionResponse {
        match FunctionResponse::json(outcome.status_code(), outcome) {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to serialize run outcome: {}", e);
                FunctionResponse {
                    status_code: 408,
                    body: serde_json::json!({
                        "error": "serialization",
                        "message": e.to_string(),
                    })
                    .to_string(),
                }
            }
        }
    }
}
