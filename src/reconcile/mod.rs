//! Drift analysis between two deployments
//!
//! The [`Analyzer`] compares two [`ActiveSet`]s by service name and
//! classifies every service. Divergence is the expected output, so analysis
//! never fails.
//!
//! Every name in A ∪ B gets exactly one membership record (`MatchedBoth`,
//! `OnlyInSourceA` or `OnlyInSourceB`). `ConfigMismatch` and
//! `NamingMismatch` records come on top of those.

pub mod report;
pub mod similarity;

pub use report::ReportFormat;

use crate::config::Settings;
use crate::model::{ActiveSet, Healthcheck, PortMapping, ServiceUnit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// How a service relates across the two sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Classification {
    MatchedBoth,
    OnlyInSourceA,
    OnlyInSourceB,
    NamingMismatch,
    ConfigMismatch,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::MatchedBoth => "MatchedBoth",
            Classification::OnlyInSourceA => "OnlyInSourceA",
            Classification::OnlyInSourceB => "OnlyInSourceB",
            Classification::NamingMismatch => "NamingMismatch",
            Classification::ConfigMismatch => "ConfigMismatch",
        };
        write!(f, "{}", s)
    }
}

/// One field that differs between matched services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDifference {
    pub field: String,
    pub a: String,
    pub b: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub service_name: String,
    pub classification: Classification,
    pub details: String,
    /// Name on the other side for naming mismatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<FieldDifference>,
}

impl DivergenceRecord {
    fn new(name: &str, classification: Classification, details: impl Into<String>) -> Self {
        Self {
            service_name: name.to_string(),
            classification,
            details: details.into(),
            counterpart: None,
            differences: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub total_a: usize,
    pub total_b: usize,
    pub matched: usize,
    pub only_a: usize,
    pub only_b: usize,
    pub naming_mismatches: usize,
    pub config_mismatches: usize,
}

impl SyncSummary {
    /// True when both sides run the same services with the same configuration
    pub fn in_sync(&self) -> bool {
        self.only_a == 0 && self.only_b == 0 && self.config_mismatches == 0
    }
}

/// Analysis result, ordered by classification then service name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub source_a: String,
    pub source_b: String,
    pub summary: SyncSummary,
    pub records: Vec<DivergenceRecord>,
}

impl SyncReport {
    pub fn records_of(&self, classification: Classification) -> impl Iterator<Item = &DivergenceRecord> {
        self.records
            .iter()
            .filter(move |r| r.classification == classification)
    }

    pub fn names_of(&self, classification: Classification) -> BTreeSet<&str> {
        self.records_of(classification)
            .map(|r| r.service_name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    threshold: f64,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self {
            threshold: crate::config::DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl Analyzer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            threshold: settings.similarity_threshold,
        }
    }

    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn analyze(&self, a: &ActiveSet<'_>, b: &ActiveSet<'_>) -> SyncReport {
        let names_a = a.names();
        let names_b = b.names();
        let mut records = Vec::new();

        let mut config_mismatches = 0;
        for name in names_a.intersection(&names_b) {
            let (Some(ua), Some(ub)) = (a.get(name), b.get(name)) else {
                continue;
            };
            let differences = compare(ua, ub);
            if differences.is_empty() {
                records.push(DivergenceRecord::new(name, Classification::MatchedBoth, "in sync"));
            } else {
                let fields: Vec<&str> = differences.iter().map(|d| d.field.as_str()).collect();
                records.push(DivergenceRecord::new(
                    name,
                    Classification::MatchedBoth,
                    format!("differs in {}", fields.join(", ")),
                ));
                let mut mismatch = DivergenceRecord::new(
                    name,
                    Classification::ConfigMismatch,
                    format!("{} field(s) differ", differences.len()),
                );
                mismatch.differences = differences;
                records.push(mismatch);
                config_mismatches += 1;
            }
        }

        let only_a: Vec<&str> = names_a.difference(&names_b).copied().collect();
        let only_b: Vec<&str> = names_b.difference(&names_a).copied().collect();

        let mut renames: Vec<(&str, &str)> = Vec::new();
        for &name_a in &only_a {
            for &name_b in &only_b {
                let score = similarity::similarity(name_a, name_b);
                if score < self.threshold {
                    continue;
                }
                let images = match (
                    a.get(name_a).and_then(|u| u.image.as_deref()),
                    b.get(name_b).and_then(|u| u.image.as_deref()),
                ) {
                    (Some(ia), Some(ib)) if normalize_image(ia) == normalize_image(ib) => {
                        "images match".to_string()
                    }
                    (Some(ia), Some(ib)) => format!("images differ ({} vs {})", ia, ib),
                    _ => "image unknown on one side".to_string(),
                };
                tracing::debug!("Possible rename: '{}' ~ '{}' ({:.2})", name_a, name_b, score);

                let mut record = DivergenceRecord::new(
                    name_a,
                    Classification::NamingMismatch,
                    format!("similarity {:.2} with '{}'; {}", score, name_b, images),
                );
                record.counterpart = Some(name_b.to_string());
                records.push(record);
                renames.push((name_a, name_b));
            }
        }

        for &name in &only_a {
            records.push(membership_record(
                name,
                Classification::OnlyInSourceA,
                &b.label,
                renames.iter().filter(|(x, _)| *x == name).map(|(_, y)| *y),
            ));
        }
        for &name in &only_b {
            records.push(membership_record(
                name,
                Classification::OnlyInSourceB,
                &a.label,
                renames.iter().filter(|(_, y)| *y == name).map(|(x, _)| *x),
            ));
        }

        records.sort_by(|x, y| {
            x.classification
                .cmp(&y.classification)
                .then_with(|| x.service_name.cmp(&y.service_name))
                .then_with(|| x.counterpart.cmp(&y.counterpart))
        });

        let summary = SyncSummary {
            total_a: a.len(),
            total_b: b.len(),
            matched: names_a.intersection(&names_b).count(),
            only_a: only_a.len(),
            only_b: only_b.len(),
            naming_mismatches: renames.len(),
            config_mismatches,
        };

        tracing::info!(
            "Compared {} and {} service(s): {} matched, {} only in {}, {} only in {}",
            summary.total_a,
            summary.total_b,
            summary.matched,
            summary.only_a,
            a.label,
            summary.only_b,
            b.label
        );

        SyncReport {
            source_a: format!("{} ({})", a.label, a.kind),
            source_b: format!("{} ({})", b.label, b.kind),
            summary,
            records,
        }
    }
}

fn membership_record<'n>(
    name: &str,
    classification: Classification,
    other: &str,
    suspects: impl Iterator<Item = &'n str>,
) -> DivergenceRecord {
    let suspects: Vec<String> = suspects.map(|s| format!("'{}'", s)).collect();
    let details = if suspects.is_empty() {
        format!("not present in {}", other)
    } else {
        format!(
            "not present in {}; possibly renamed to {}",
            other,
            suspects.join(" or ")
        )
    };
    DivergenceRecord::new(name, classification, details)
}

/// Fixed checklist: image, ports, restart policy, healthcheck
fn compare(a: &ServiceUnit, b: &ServiceUnit) -> Vec<FieldDifference> {
    let mut diffs = Vec::new();

    let image_a = a.image.as_deref().map(normalize_image);
    let image_b = b.image.as_deref().map(normalize_image);
    if image_a != image_b {
        diffs.push(FieldDifference {
            field: "image".to_string(),
            a: a.image.clone().unwrap_or_else(|| "-".to_string()),
            b: b.image.clone().unwrap_or_else(|| "-".to_string()),
        });
    }

    let mut ports_a = a.ports.clone();
    let mut ports_b = b.ports.clone();
    ports_a.sort();
    ports_b.sort();
    if ports_a != ports_b {
        diffs.push(FieldDifference {
            field: "ports".to_string(),
            a: format_ports(&ports_a),
            b: format_ports(&ports_b),
        });
    }

    if let (Some(ra), Some(rb)) = (&a.restart_policy, &b.restart_policy) {
        if !ra.restarts_like(rb) {
            diffs.push(FieldDifference {
                field: "restart".to_string(),
                a: ra.to_string(),
                b: rb.to_string(),
            });
        }
    }

    if a.healthcheck != b.healthcheck {
        diffs.push(FieldDifference {
            field: "healthcheck".to_string(),
            a: format_healthcheck(a.healthcheck.as_ref()),
            b: format_healthcheck(b.healthcheck.as_ref()),
        });
    }

    diffs
}

/// `nginx`, `library/nginx` and `docker.io/library/nginx:latest` are one image
pub fn normalize_image(image: &str) -> String {
    let mut name = image
        .strip_prefix("docker.io/")
        .or_else(|| image.strip_prefix("index.docker.io/"))
        .unwrap_or(image);
    name = name.strip_prefix("library/").unwrap_or(name);

    let last = name.rsplit('/').next().unwrap_or(name);
    if name.contains('@') || last.contains(':') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}

fn format_ports(ports: &[PortMapping]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports
        .iter()
        .map(PortMapping::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_healthcheck(hc: Option<&Healthcheck>) -> String {
    match hc {
        None => "-".to_string(),
        Some(hc) => format!(
            "{} every {}ms, timeout {}ms, {} retries, start period {}ms",
            hc.command.join(" "),
            hc.interval_ms,
            hc.timeout_ms,
            hc.retries,
            hc.start_period_ms
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProfileSelection, RestartPolicy, ServiceGraph, SourceKind};

    fn unit(name: &str, image: &str) -> ServiceUnit {
        let mut unit = ServiceUnit::new(name);
        unit.image = Some(image.to_string());
        unit
    }

    fn graph(name: &str, kind: SourceKind, units: Vec<ServiceUnit>) -> ServiceGraph {
        let mut graph = ServiceGraph::new(name, kind);
        for u in units {
            graph.services.insert(u.name.clone(), u);
        }
        graph
    }

    #[test]
    fn test_set_algebra_holds() {
        let cases: Vec<(Vec<&str>, Vec<&str>)> = vec![
            (vec!["web", "db", "cache"], vec!["web", "worker", "db"]),
            (vec![], vec!["web", "db"]),
            (vec!["web", "db"], vec![]),
            (vec![], vec![]),
            (vec!["alpha", "beta"], vec!["gamma", "delta"]),
            (vec!["headscale", "db"], vec!["headscale-ui", "db"]),
            (vec!["api", "api-worker"], vec!["api-server", "api_worker"]),
        ];

        for (names_a, names_b) in cases {
            let a = graph("a", SourceKind::Compose, names_a.iter().map(|n| unit(n, "img")).collect());
            let b = graph("b", SourceKind::Nomad, names_b.iter().map(|n| unit(n, "img")).collect());
            let sel = ProfileSelection::none();
            let report = Analyzer::default().analyze(&a.active_set(&sel), &b.active_set(&sel));

            let s = &report.summary;
            assert_eq!(s.total_a, names_a.len(), "{:?} vs {:?}", names_a, names_b);
            assert_eq!(s.total_b, names_b.len(), "{:?} vs {:?}", names_a, names_b);
            assert_eq!(s.matched + s.only_a, s.total_a, "{:?} vs {:?}", names_a, names_b);
            assert_eq!(s.matched + s.only_b, s.total_b, "{:?} vs {:?}", names_a, names_b);

            let expected_only_a: BTreeSet<&str> =
                names_a.iter().copied().filter(|n| !names_b.contains(n)).collect();
            let expected_only_b: BTreeSet<&str> =
                names_b.iter().copied().filter(|n| !names_a.contains(n)).collect();
            assert_eq!(report.names_of(Classification::OnlyInSourceA), expected_only_a);
            assert_eq!(report.names_of(Classification::OnlyInSourceB), expected_only_b);
        }
    }

    #[test]
    fn test_suffix_rename_is_naming_mismatch() {
        let a = graph("a", SourceKind::Compose, vec![unit("headscale", "headscale/headscale:0.23")]);
        let b = graph("b", SourceKind::Nomad, vec![unit("headscale-ui", "headscale/headscale:0.23")]);
        let sel = ProfileSelection::none();
        let report = Analyzer::default().analyze(&a.active_set(&sel), &b.active_set(&sel));

        let naming: Vec<&DivergenceRecord> = report.records_of(Classification::NamingMismatch).collect();
        assert_eq!(naming.len(), 1);
        assert_eq!(naming[0].service_name, "headscale");
        assert_eq!(naming[0].counterpart.as_deref(), Some("headscale-ui"));
        assert!(naming[0].details.contains("images match"));

        let only_a: Vec<&DivergenceRecord> = report.records_of(Classification::OnlyInSourceA).collect();
        assert!(only_a[0].details.contains("possibly renamed to 'headscale-ui'"));
        assert_eq!(report.summary.naming_mismatches, 1);
    }

    #[test]
    fn test_threshold_suppresses_naming_mismatch() {
        let a = graph("a", SourceKind::Compose, vec![unit("postgres", "postgres")]);
        let b = graph("b", SourceKind::Nomad, vec![unit("postgresql", "postgres")]);
        let sel = ProfileSelection::none();
        let strict = Analyzer::with_threshold(0.95).analyze(&a.active_set(&sel), &b.active_set(&sel));
        assert_eq!(strict.summary.naming_mismatches, 0);
        let loose = Analyzer::with_threshold(0.70).analyze(&a.active_set(&sel), &b.active_set(&sel));
        assert_eq!(loose.summary.naming_mismatches, 1);
    }

    #[test]
    fn test_config_mismatch_lists_fields() {
        let mut wa = unit("web", "nginx:1.25");
        wa.restart_policy = Some(RestartPolicy::Always);
        wa.ports.push(PortMapping {
            container_port: 80,
            host_port: Some(8080),
            protocol: Default::default(),
        });
        let mut wb = unit("web", "nginx:1.27");
        wb.restart_policy = Some(RestartPolicy::No);

        let a = graph("a", SourceKind::Compose, vec![wa]);
        let b = graph("b", SourceKind::Nomad, vec![wb]);
        let sel = ProfileSelection::none();
        let report = Analyzer::default().analyze(&a.active_set(&sel), &b.active_set(&sel));

        assert_eq!(report.summary.matched, 1);
        assert_eq!(report.summary.config_mismatches, 1);
        let mismatch = report.records_of(Classification::ConfigMismatch).next().unwrap();
        let fields: Vec<&str> = mismatch.differences.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["image", "ports", "restart"]);
    }

    #[test]
    fn test_restart_ignored_when_one_side_silent() {
        let mut wa = unit("web", "nginx");
        wa.restart_policy = Some(RestartPolicy::Always);
        let wb = unit("web", "docker.io/library/nginx:latest");

        let a = graph("a", SourceKind::Compose, vec![wa]);
        let b = graph("b", SourceKind::Nomad, vec![wb]);
        let sel = ProfileSelection::none();
        let report = Analyzer::default().analyze(&a.active_set(&sel), &b.active_set(&sel));
        assert!(report.summary.in_sync());
    }

    #[test]
    fn test_unless_stopped_matches_always() {
        let mut wa = unit("web", "nginx");
        wa.restart_policy = Some(RestartPolicy::UnlessStopped);
        let mut wb = unit("web", "nginx");
        wb.restart_policy = Some(RestartPolicy::Always);

        let a = graph("a", SourceKind::Compose, vec![wa]);
        let b = graph("b", SourceKind::Nomad, vec![wb]);
        let sel = ProfileSelection::none();
        let report = Analyzer::default().analyze(&a.active_set(&sel), &b.active_set(&sel));
        assert!(report.summary.in_sync());
    }

    #[test]
    fn test_records_are_ordered() {
        let a = graph("a", SourceKind::Compose, vec![unit("z", "x"), unit("b", "x"), unit("only", "x")]);
        let b = graph("b", SourceKind::Nomad, vec![unit("z", "x"), unit("b", "x")]);
        let sel = ProfileSelection::none();
        let report = Analyzer::default().analyze(&a.active_set(&sel), &b.active_set(&sel));
        let order: Vec<(Classification, &str)> = report
            .records
            .iter()
            .map(|r| (r.classification, r.service_name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (Classification::MatchedBoth, "b"),
                (Classification::MatchedBoth, "z"),
                (Classification::OnlyInSourceA, "only"),
            ]
        );
    }

    #[test]
    fn test_normalize_image() {
        assert_eq!(normalize_image("nginx"), "nginx:latest");
        assert_eq!(normalize_image("docker.io/library/nginx:1.25"), "nginx:1.25");
        assert_eq!(normalize_image("registry:5000/team/app"), "registry:5000/team/app:latest");
        assert_eq!(normalize_image("app@sha256:abc"), "app@sha256:abc");
    }
}
