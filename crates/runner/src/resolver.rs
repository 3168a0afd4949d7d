//! Test file resolution
//!
//! Turns caller-supplied references into local files. Each reference is
//! tried, in order, as an existing path, as a path under the working
//! directory, and as an HTTP(S) URL whose body is written to a temporary
//! `.js` file. References that resolve nowhere are skipped with a warning.

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info, warn};
use url::Url;

use suiterun_common::{Config, Origin, ResolvedTestFile, TestReference};

use crate::error::{RunError, RunResult};

/// Longest file name prefix derived from a reference
const MAX_PREFIX_LEN: usize = 96;

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9-]+").expect("valid regex"));

/// Outcome of a filesystem existence check
#[derive(Debug)]
pub enum Presence {
    Present,
    Absent,
    /// The check itself failed; callers treat this as absent
    Unknown(std::io::Error),
}

impl Presence {
    pub fn is_present(&self) -> bool {
        matches!(self, Presence::Present)
    }
}

/// Check whether `path` exists without treating probe failures as fatal
pub fn probe(path: &Path) -> Presence {
    match path.try_exists() {
        Ok(true) => Presence::Present,
        Ok(false) => Presence::Absent,
        Err(e) => Presence::Unknown(e),
    }
}

/// Fetches the body of a remote test file
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> RunResult<Bytes>;
}

/// `RemoteFetcher` over HTTP(S)
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> RunResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> RunResult<Bytes> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RunError::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }
        Ok(response.bytes().await?)
    }
}

/// Parse a reference as a remote URL; only http and https qualify
pub fn remote_url(reference: &str) -> Option<Url> {
    let url = Url::parse(reference.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// File name prefix for a fetched reference
pub fn temp_prefix(reference: &str) -> String {
    let mut prefix = UNSAFE_CHARS.replace_all(reference, "-").into_owned();
    prefix.truncate(MAX_PREFIX_LEN);
    prefix.push('-');
    prefix
}

/// Resolved files of one run.
///
/// Fetched files are deleted when the suite is dropped.
#[derive(Debug, Default)]
pub struct ResolvedSuite {
    files: Vec<ResolvedTestFile>,
    temp_files: Vec<TempPath>,
}

impl ResolvedSuite {
    pub fn files(&self) -> &[ResolvedTestFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Give up ownership of fetched files so they outlive the suite
    pub fn persist(mut self) -> Vec<ResolvedTestFile> {
        for temp in self.temp_files.drain(..) {
            if let Err(e) = temp.keep() {
                warn!("Failed to keep fetched test file: {}", e);
            }
        }
        std::mem::take(&mut self.files)
    }
}

pub struct TestFileResolver {
    working_dir: PathBuf,
    scratch_dir: PathBuf,
    keep_fetched: bool,
    fetcher: Arc<dyn RemoteFetcher>,
}

impl TestFileResolver {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        fetcher: Arc<dyn RemoteFetcher>,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            scratch_dir: scratch_dir.into(),
            keep_fetched: false,
            fetcher,
        }
    }

    pub fn from_config(config: &Config) -> RunResult<Self> {
        let fetcher = HttpFetcher::new(Duration::from_secs(config.resolver.fetch_timeout_secs))?;
        Ok(Self::new(
            config.working_dir(),
            config.resolver.scratch_dir.clone(),
            Arc::new(fetcher),
        )
        .keep_fetched(config.resolver.keep_fetched))
    }

    pub fn keep_fetched(mut self, keep: bool) -> Self {
        self.keep_fetched = keep;
        self
    }

    /// Resolve references in order, skipping the ones that cannot be resolved
    pub async fn resolve(&self, references: &[TestReference]) -> ResolvedSuite {
        let mut suite = ResolvedSuite::default();

        for reference in references {
            match self.resolve_one(reference).await {
                Some((file, temp)) => {
                    debug!(
                        "Resolved {} -> {} ({})",
                        reference,
                        file.path.display(),
                        file.origin
                    );
                    suite.files.push(file);
                    suite.temp_files.extend(temp);
                }
                None => {
                    warn!("Test file {} is unresolved, skipping", reference);
                }
            }
        }

        info!(
            "Resolved {} of {} test file(s)",
            suite.files.len(),
            references.len()
        );
        suite
    }

    async fn resolve_one(
        &self,
        reference: &TestReference,
    ) -> Option<(ResolvedTestFile, Option<TempPath>)> {
        let given = PathBuf::from(reference.as_str());
        if self.exists(&given) {
            return Some((
                ResolvedTestFile {
                    reference: reference.clone(),
                    path: given,
                    origin: Origin::AsGiven,
                },
                None,
            ));
        }

        let joined = self.working_dir.join(reference.as_str());
        if self.exists(&joined) {
            return Some((
                ResolvedTestFile {
                    reference: reference.clone(),
                    path: joined,
                    origin: Origin::WorkingDir,
                },
                None,
            ));
        }

        let url = remote_url(reference.as_str())?;
        match self.fetch_to_temp(reference, &url).await {
            Ok((path, temp)) => Some((
                ResolvedTestFile {
                    reference: reference.clone(),
                    path,
                    origin: Origin::Fetched {
                        url: url.to_string(),
                    },
                },
                temp,
            )),
            Err(e) => {
                debug!("Fetching {} failed: {}", url, e);
                None
            }
        }
    }

    fn exists(&self, path: &Path) -> bool {
        match probe(path) {
            Presence::Unknown(e) => {
                debug!("Existence check for {} failed: {}", path.display(), e);
                false
            }
            presence => presence.is_present(),
        }
    }

    async fn fetch_to_temp(
        &self,
        reference: &TestReference,
        url: &Url,
    ) -> RunResult<(PathBuf, Option<TempPath>)> {
        let content = self.fetcher.fetch(url).await?;

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let temp = tempfile::Builder::new()
            .prefix(&temp_prefix(reference.as_str()))
            .suffix(".js")
            .tempfile_in(&self.scratch_dir)?
            .into_temp_path();
        tokio::fs::write(&temp, &content).await?;

        if self.keep_fetched {
            let path = temp.keep().map_err(|e| RunError::Io(e.error))?;
            Ok((path, None))
        } else {
            Ok((temp.to_path_buf(), Some(temp)))
        }
    }
}
