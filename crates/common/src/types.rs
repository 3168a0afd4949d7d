//! Core types for suiterun

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

/// Marker recorded for a test file that produced no structured report
pub const NOT_PASSED: &str = "Not passed";

/// Caller-supplied identifier for a test file: a local path, a bare file
/// name relative to the working directory, or a remote URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestReference(String);

impl TestReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Promote a single reference or a list of references to a list
    pub fn many(input: OneOrMany) -> Vec<TestReference> {
        match input {
            OneOrMany::One(reference) => vec![TestReference(reference)],
            OneOrMany::Many(references) => references.into_iter().map(TestReference).collect(),
        }
    }
}

impl fmt::Display for TestReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestReference {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TestReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A string or a list of strings, as accepted by `testFilesPaths`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// How a reference was turned into a local file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    /// The reference named an existing path as given
    AsGiven,
    /// The reference exists relative to the working directory
    WorkingDir,
    /// The reference was downloaded into a temporary file
    Fetched { url: String },
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::AsGiven => write!(f, "as-given"),
            Origin::WorkingDir => write!(f, "working-dir"),
            Origin::Fetched { .. } => write!(f, "fetched"),
        }
    }
}

/// A local file path that existed when it was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTestFile {
    pub reference: TestReference,
    pub path: PathBuf,
    pub origin: Origin,
}

/// Per-file entry of a run report
#[derive(Debug, Clone, PartialEq)]
pub enum FileReport {
    /// Structured report emitted by the automation framework
    Json(serde_json::Value),
    /// No report bytes were captured
    NotPassed,
}

impl FileReport {
    /// Whether a structured report was captured
    pub fn is_structured(&self) -> bool {
        matches!(self, FileReport::Json(_))
    }
}

impl Serialize for FileReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FileReport::Json(value) => value.serialize(serializer),
            FileReport::NotPassed => serializer.serialize_str(NOT_PASSED),
        }
    }
}

/// Ordered mapping from test reference to its report.
///
/// Keys keep the order of first insertion; inserting an existing key
/// replaces the value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    entries: Vec<(TestReference, FileReport)>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: TestReference, report: FileReport) {
        match self.entries.iter_mut().find(|(key, _)| *key == reference) {
            Some((_, existing)) => *existing = report,
            None => self.entries.push((reference, report)),
        }
    }

    pub fn get(&self, reference: &str) -> Option<&FileReport> {
        self.entries
            .iter()
            .find(|(key, _)| key.as_str() == reference)
            .map(|(_, report)| report)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TestReference> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TestReference, &FileReport)> {
        self.entries.iter().map(|(key, report)| (key, report))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for RunReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (reference, report) in &self.entries {
            map.serialize_entry(reference.as_str(), report)?;
        }
        map.end()
    }
}

/// Serialized form of a run-level failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    #[serde(rename = "error")]
    pub kind: String,
    pub message: String,
}

/// Result of one run: the report, or the run-level failure that stopped it
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }

    /// Status code reported to the function host
    pub fn status_code(&self) -> u16 {
        match self {
            RunOutcome::Completed(_) => 200,
            RunOutcome::Failed(_) => 408,
        }
    }
}

impl Serialize for RunOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RunOutcome::Completed(report) => report.serialize(serializer),
            RunOutcome::Failed(failure) => failure.serialize(serializer),
        }
    }
}

/// HTTP-style response returned to the function host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub status_code: u16,
    /// JSON-encoded body
    pub body: String,
}

impl FunctionResponse {
    pub fn json<T: Serialize + ?Sized>(status_code: u16, body: &T) -> crate::Result<Self> {
        Ok(Self {
            status_code,
            body: serde_json::to_string(body)?,
        })
    }
}
