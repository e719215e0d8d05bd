//! Sync report rendering

use super::{Classification, SyncReport};
use crate::error::Result;
use std::fmt::Write;

/// Output format of `diff`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
}

pub fn render(report: &SyncReport, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Markdown => Ok(to_markdown(report)),
        ReportFormat::Json => to_json(report),
    }
}

pub fn to_json(report: &SyncReport) -> Result<String> {
    let mut out = serde_json::to_string_pretty(report)?;
    out.push('\n');
    Ok(out)
}

pub fn to_markdown(report: &SyncReport) -> String {
    let s = &report.summary;
    let mut out = String::new();

    let _ = writeln!(out, "# Sync report\n");
    let _ = writeln!(out, "- **A:** {}", report.source_a);
    let _ = writeln!(out, "- **B:** {}\n", report.source_b);

    out.push_str("| | Services |\n|---|---:|\n");
    for (label, count) in [
        ("Total in A", s.total_a),
        ("Total in B", s.total_b),
        ("Matched", s.matched),
        ("Only in A", s.only_a),
        ("Only in B", s.only_b),
        ("Naming mismatches", s.naming_mismatches),
        ("Configuration mismatches", s.config_mismatches),
    ] {
        let _ = writeln!(out, "| {} | {} |", label, count);
    }

    if s.in_sync() {
        out.push_str("\nBoth sources run the same services with the same configuration.\n");
    }

    section(&mut out, report, Classification::MatchedBoth, "Matched");
    section(&mut out, report, Classification::OnlyInSourceA, "Only in A");
    section(&mut out, report, Classification::OnlyInSourceB, "Only in B");
    section(&mut out, report, Classification::NamingMismatch, "Naming mismatches");

    let mismatches: Vec<_> = report.records_of(Classification::ConfigMismatch).collect();
    if !mismatches.is_empty() {
        out.push_str("\n## Configuration mismatches\n");
        for record in mismatches {
            let _ = writeln!(out, "\n### `{}`\n", record.service_name);
            out.push_str("| Field | A | B |\n|---|---|---|\n");
            for diff in &record.differences {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} |",
                    diff.field,
                    cell(&diff.a),
                    cell(&diff.b)
                );
            }
        }
    }

    out
}

fn section(out: &mut String, report: &SyncReport, classification: Classification, title: &str) {
    let records: Vec<_> = report.records_of(classification).collect();
    if records.is_empty() {
        return;
    }

    let _ = writeln!(out, "\n## {}\n", title);
    for record in records {
        match &record.counterpart {
            Some(other) => {
                let _ = writeln!(
                    out,
                    "- `{}` ↔ `{}`: {}",
                    record.service_name, other, record.details
                );
            }
            None => {
                let _ = writeln!(out, "- `{}`: {}", record.service_name, record.details);
            }
        }
    }
}

fn cell(value: &str) -> String {
    format!("`{}`", value.replace('|', "\\|").replace('`', "'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{DivergenceRecord, FieldDifference, SyncSummary};

    fn sample() -> SyncReport {
        SyncReport {
            source_a: "app (compose)".to_string(),
            source_b: "app (nomad)".to_string(),
            summary: SyncSummary {
                total_a: 2,
                total_b: 2,
                matched: 1,
                only_a: 1,
                only_b: 1,
                naming_mismatches: 1,
                config_mismatches: 1,
            },
            records: vec![
                DivergenceRecord {
                    service_name: "web".to_string(),
                    classification: Classification::MatchedBoth,
                    details: "differs in image".to_string(),
                    counterpart: None,
                    differences: Vec::new(),
                },
                DivergenceRecord {
                    service_name: "headscale".to_string(),
                    classification: Classification::NamingMismatch,
                    details: "similarity 1.00".to_string(),
                    counterpart: Some("headscale-ui".to_string()),
                    differences: Vec::new(),
                },
                DivergenceRecord {
                    service_name: "web".to_string(),
                    classification: Classification::ConfigMismatch,
                    details: "1 field(s) differ".to_string(),
                    counterpart: None,
                    differences: vec![FieldDifference {
                        field: "healthcheck".to_string(),
                        a: "test | grep ok".to_string(),
                        b: "-".to_string(),
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_markdown_layout() {
        let md = to_markdown(&sample());
        assert!(md.starts_with("# Sync report\n"));
        assert!(md.contains("| Matched | 1 |"));
        assert!(md.contains("- `headscale` ↔ `headscale-ui`: similarity 1.00"));
        assert!(md.contains("### `web`"));
        assert!(md.contains("| healthcheck | `test \\| grep ok` | `-` |"));
        assert!(!md.contains("same configuration"));
    }

    #[test]
    fn test_json_is_parseable() {
        let json = render(&sample(), ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["matched"], 1);
        assert_eq!(value["records"][1]["classification"], "NamingMismatch");
        assert_eq!(value["records"][1]["counterpart"], "headscale-ui");
    }
}
