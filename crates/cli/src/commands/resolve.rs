//! Show how references resolve without running them

use clap::Args;
use serde::Serialize;

use suiterun_common::{Config, ResolvedTestFile, TestReference};
use suiterun_runner::TestFileResolver;

use crate::output::{self, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ResolveArgs {
    /// Test file paths or HTTP(S) URLs
    #[arg(required = true)]
    pub references: Vec<String>,

    /// Keep fetched files so they can be inspected
    #[arg(long)]
    pub keep_fetched: bool,
}

#[derive(Debug, Serialize)]
pub struct Resolution {
    pub reference: String,
    #[serde(rename = "resolved")]
    pub file: Option<ResolvedTestFile>,
}

impl TableDisplay for Resolution {
    fn headers() -> Vec<&'static str> {
        vec!["Reference", "Origin", "Path"]
    }

    fn row(&self) -> Vec<String> {
        match &self.file {
            Some(file) => vec![
                self.reference.clone(),
                file.origin.to_string(),
                file.path.display().to_string(),
            ],
            None => vec![self.reference.clone(), "unresolved".to_string(), "-".to_string()],
        }
    }
}

/// Pair every reference with its resolved file, in input order
pub fn resolutions(references: &[TestReference], files: &[ResolvedTestFile]) -> Vec<Resolution> {
    let mut remaining: Vec<&ResolvedTestFile> = files.iter().collect();
    references
        .iter()
        .map(|reference| {
            let position = remaining.iter().position(|f| f.reference == *reference);
            Resolution {
                reference: reference.to_string(),
                file: position.map(|i| remaining.remove(i).clone()),
            }
        })
        .collect()
}

pub async fn execute(args: ResolveArgs, mut config: Config, format: OutputFormat) -> anyhow::Result<()> {
    config.resolver.keep_fetched = args.keep_fetched;
    let resolver = TestFileResolver::from_config(&config)?;
    let references: Vec<TestReference> = args.references.into_iter().map(TestReference::from).collect();

    let suite = resolver.resolve(&references).await;
    let unresolved = references.len() - suite.len();

    output::print_list(&resolutions(&references, suite.files()), format);
    if unresolved > 0 {
        output::print_warning(&format!("{} reference(s) could not be resolved", unresolved));
    }
    Ok(())
}
