//! Error types for nomadic

use std::fmt;
use thiserror::Error;

/// Result type for nomadic operations
pub type Result<T> = std::result::Result<T, NomadicError>;

/// nomadic error types
#[derive(Error, Debug)]
pub enum NomadicError {
    #[error("Parse error in {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    #[error("Unresolved references: {}", .0.join("; "))]
    Reference(Vec<String>),

    #[error("Network '{name}' declared with conflicting drivers '{first}' and '{second}'")]
    DuplicateNetwork {
        name: String,
        first: String,
        second: String,
    },

    #[error("Integrity check failed with {} problem(s): {}", .0.len(), join_issues(.0))]
    Integrity(Vec<IntegrityIssue>),

    #[error("Emit error: {0}")]
    Emit(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl NomadicError {
    /// Build a parse error for a named source
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// The kind of dangling or inconsistent reference found in a graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    UnknownDependency,
    UnknownNetwork,
    UnknownSecret,
    UnknownNetworkModeTarget,
    DuplicateService,
    DependencyCycle,
}

/// One integrity problem: the service that holds the reference and the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub service: String,
    pub reference: String,
    pub kind: IssueKind,
}

impl IntegrityIssue {
    pub fn new(service: impl Into<String>, reference: impl Into<String>, kind: IssueKind) -> Self {
        Self {
            service: service.into(),
            reference: reference.into(),
            kind,
        }
    }
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IssueKind::UnknownDependency => write!(
                f,
                "service '{}' depends on unknown service '{}'",
                self.service, self.reference
            ),
            IssueKind::UnknownNetwork => write!(
                f,
                "service '{}' references undefined network '{}'",
                self.service, self.reference
            ),
            IssueKind::UnknownSecret => write!(
                f,
                "service '{}' references undefined secret '{}'",
                self.service, self.reference
            ),
            IssueKind::UnknownNetworkModeTarget => write!(
                f,
                "service '{}' shares the network of unknown service '{}'",
                self.service, self.reference
            ),
            IssueKind::DuplicateService => write!(
                f,
                "service '{}' is defined more than once ({})",
                self.service, self.reference
            ),
            IssueKind::DependencyCycle => write!(
                f,
                "circular dependency detected for service '{}' via '{}'",
                self.service, self.reference
            ),
        }
    }
}

fn join_issues(issues: &[IntegrityIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_error_lists_every_issue() {
        let err = NomadicError::Integrity(vec![
            IntegrityIssue::new("web", "db", IssueKind::UnknownDependency),
            IntegrityIssue::new("web", "backend", IssueKind::UnknownNetwork),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 problem(s)"));
        assert!(msg.contains("service 'web' depends on unknown service 'db'"));
        assert!(msg.contains("undefined network 'backend'"));
    }
}
