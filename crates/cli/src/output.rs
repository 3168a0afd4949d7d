//! Output formatting for CLI

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use suiterun_common::{FileReport, RunFailure, RunReport};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed JSON, the same body the function handler returns
    #[default]
    Json,
    /// Human-readable table format
    Table,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => println!("{}", table(T::headers(), [item.row()])),
        OutputFormat::Json => print_json(item),
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No items found.");
                return;
            }
            println!("{}", table(T::headers(), items.iter().map(T::row)));
        }
        OutputFormat::Json => print_json(&items),
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => print_error(&format!("Failed to serialize output: {}", e)),
    }
}

fn table(headers: Vec<&'static str>, rows: impl IntoIterator<Item = Vec<String>>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(headers);
    for row in rows {
        table.add_row(row);
    }
    table
}

/// One row of a run report
#[derive(Debug, Serialize)]
pub struct ReportRow<'a> {
    pub reference: &'a str,
    pub report: &'a FileReport,
}

impl TableDisplay for ReportRow<'_> {
    fn headers() -> Vec<&'static str> {
        vec!["Test file", "Result", "Passed", "Total", "Skipped"]
    }

    fn row(&self) -> Vec<String> {
        match self.report {
            FileReport::Json(report) => {
                let number = |key: &str| report.get(key).and_then(|v| v.as_u64());
                let count = |key: &str| number(key).map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
                let result = match (number("passed"), number("total")) {
                    (Some(passed), Some(total)) if passed + number("skipped").unwrap_or(0) >= total => {
                        "passed"
                    }
                    (Some(_), Some(_)) => "failed",
                    _ => "reported",
                };
                vec![
                    self.reference.to_string(),
                    result.to_string(),
                    count("passed"),
                    count("total"),
                    count("skipped"),
                ]
            }
            FileReport::NotPassed => vec![
                self.reference.to_string(),
                suiterun_common::NOT_PASSED.to_string(),
                "-".to_string(),
                "-".to_string(),
                "-".to_string(),
            ],
        }
    }
}

pub fn report_rows(report: &RunReport) -> Vec<ReportRow<'_>> {
    report
        .iter()
        .map(|(reference, report)| ReportRow {
            reference: reference.as_str(),
            report,
        })
        .collect()
}

pub fn print_failure(failure: &RunFailure) {
    print_error(&format!("Run failed ({}): {}", failure.kind, failure.message));
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("⚠️  {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_rows() {
        let mut report = RunReport::new();
        report.insert("a.js".into(), FileReport::Json(json!({"total": 3, "passed": 2, "skipped": 1})));
        report.insert("b.js".into(), FileReport::Json(json!({"total": 2, "passed": 1, "skipped": 0})));
        report.insert("c.js".into(), FileReport::NotPassed);

        let rows: Vec<Vec<String>> = report_rows(&report).iter().map(ReportRow::row).collect();
        assert_eq!(rows[0], vec!["a.js", "passed", "2", "3", "1"]);
        assert_eq!(rows[1][1], "failed");
        assert_eq!(rows[2], vec!["c.js", "Not passed", "-", "-", "-"]);
    }

    #[test]
    fn test_unknown_report_shape() {
        let report = FileReport::Json(json!({"custom": true}));
        let row = ReportRow {
            reference: "x.js",
            report: &report,
        }
        .row();
        assert_eq!(row[1], "reported");
        assert_eq!(row[2], "-");
    }
}
