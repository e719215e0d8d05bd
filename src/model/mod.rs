//! Canonical service model
//!
//! Both Compose projects and Nomad jobs are lifted into a [`ServiceGraph`]
//! so that conversion and drift analysis operate on one shape regardless of
//! the source format.

pub mod builder;

pub use builder::ModelBuilder;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Where a graph was loaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Compose,
    Nomad,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Compose => write!(f, "compose"),
            SourceKind::Nomad => write!(f, "nomad"),
        }
    }
}

/// Transport protocol of a port mapping
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A published or exposed container port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: Protocol,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_port {
            Some(host) => write!(f, "{}:{}/{}", host, self.container_port, self.protocol),
            None => write!(f, "{}/{}", self.container_port, self.protocol),
        }
    }
}

/// A volume or bind mount
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path or named volume; `None` for anonymous volumes
    pub source: Option<String>,
    pub target: String,
    /// Access mode exactly as written (`ro`, `rw`, ...)
    pub mode: Option<String>,
}

impl VolumeMount {
    /// Host path mounts start with a path component; everything else names a volume
    pub fn is_bind(&self) -> bool {
        self.source
            .as_deref()
            .map(|s| s.starts_with('/') || s.starts_with('.') || s.starts_with('~'))
            .unwrap_or(false)
    }

    pub fn is_read_only(&self) -> bool {
        self.mode
            .as_deref()
            .map(|m| m.split(',').any(|opt| opt == "ro"))
            .unwrap_or(false)
    }
}

/// Condition attached to a dependency edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    #[default]
    ServiceStarted,
    ServiceHealthy,
    ServiceCompletedSuccessfully,
}

impl DependencyCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceStarted => "service_started",
            Self::ServiceHealthy => "service_healthy",
            Self::ServiceCompletedSuccessfully => "service_completed_successfully",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "service_started" => Some(Self::ServiceStarted),
            "service_healthy" => Some(Self::ServiceHealthy),
            "service_completed_successfully" => Some(Self::ServiceCompletedSuccessfully),
            _ => None,
        }
    }
}

/// Health check with all timings in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    /// Argument vector; shell-form tests are wrapped in `/bin/sh -c`
    pub command: Vec<String>,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub retries: u32,
    pub start_period_ms: u64,
}

/// Docker's defaults for unset healthcheck fields
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEALTH_RETRIES: u32 = 3;

/// Resource limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// MHz-equivalent CPU share
    pub cpu_shares: Option<u32>,
    pub memory_limit_bytes: Option<u64>,
}

/// Restart policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "policy")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure { max_attempts: Option<u32> },
    UnlessStopped,
}

impl RestartPolicy {
    /// Whether two policies restart a workload the same way on a
    /// scheduler that has no notion of a manual stop
    pub fn restarts_like(&self, other: &RestartPolicy) -> bool {
        let unstoppable = |p: &RestartPolicy| matches!(p, Self::Always | Self::UnlessStopped);
        self == other || (unstoppable(self) && unstoppable(other))
    }

    /// Parse the Compose `restart:` value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no" | "\"no\"" => Some(Self::No),
            "always" => Some(Self::Always),
            "unless-stopped" => Some(Self::UnlessStopped),
            "on-failure" => Some(Self::OnFailure { max_attempts: None }),
            other => {
                let attempts = other.strip_prefix("on-failure:")?;
                attempts.parse().ok().map(|n| Self::OnFailure {
                    max_attempts: Some(n),
                })
            }
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure { max_attempts: None } => write!(f, "on-failure"),
            RestartPolicy::OnFailure {
                max_attempts: Some(n),
            } => write!(f, "on-failure:{}", n),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

/// Network namespace a workload runs in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "target")]
pub enum NetworkMode {
    #[default]
    Bridge,
    Host,
    None,
    /// Shares the namespace of another service (`service:<name>`)
    Service(String),
    /// Shares the namespace of a named container (`container:<name>`)
    Container(String),
    Other(String),
}

impl NetworkMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "bridge" | "default" => Self::Bridge,
            "host" => Self::Host,
            "none" => Self::None,
            other => {
                if let Some(svc) = other.strip_prefix("service:") {
                    Self::Service(svc.to_string())
                } else if let Some(c) = other.strip_prefix("container:") {
                    Self::Container(c.to_string())
                } else {
                    Self::Other(other.to_string())
                }
            }
        }
    }
}

/// Network scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkScope {
    /// Created and owned by the deployment
    #[default]
    Internal,
    /// Pre-existing network managed elsewhere
    External,
    /// The host's network stack
    Host,
}

/// Network definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDef {
    pub name: String,
    pub driver: String,
    pub scope: NetworkScope,
}

/// Where a secret's value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum SecretSource {
    File(String),
    Environment(String),
    /// Managed outside the deployment; holds the reference key
    External(String),
}

/// Top-level secret definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDef {
    pub name: String,
    pub source: SecretSource,
}

/// A secret mounted into one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub source: SecretSource,
    pub target: String,
}

/// Default mount directory for Compose secrets
pub const SECRETS_DIR: &str = "/run/secrets";

/// One deployable workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUnit {
    pub name: String,
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub networks: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub depends_on: BTreeMap<String, DependencyCondition>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub profiles: BTreeSet<String>,
    pub healthcheck: Option<Healthcheck>,
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretRef>,
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub replicas: u32,
    pub network_mode: NetworkMode,
    /// Nomad group the unit was loaded from
    pub group: Option<String>,
    pub is_scaled_to_zero: bool,
    /// Source keys with no canonical representation
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unmapped: BTreeSet<String>,
}

impl ServiceUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            command: Vec::new(),
            entrypoint: Vec::new(),
            environment: BTreeMap::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            networks: BTreeSet::new(),
            depends_on: BTreeMap::new(),
            profiles: BTreeSet::new(),
            healthcheck: None,
            resources: None,
            secrets: Vec::new(),
            restart_policy: None,
            labels: BTreeMap::new(),
            working_dir: None,
            user: None,
            replicas: 1,
            network_mode: NetworkMode::Bridge,
            group: None,
            is_scaled_to_zero: false,
            unmapped: BTreeSet::new(),
        }
    }

    /// Whether the unit is eligible to run under the given profile selection
    pub fn is_active(&self, selection: &ProfileSelection) -> bool {
        !self.is_scaled_to_zero && selection.enables(&self.profiles)
    }
}

/// Profiles enabled by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSelection {
    enabled: BTreeSet<String>,
    all: bool,
}

impl ProfileSelection {
    /// No profiles enabled: only untagged services are active
    pub fn none() -> Self {
        Self::default()
    }

    /// Every profile enabled
    pub fn all() -> Self {
        Self {
            enabled: BTreeSet::new(),
            all: true,
        }
    }

    /// `*` enables everything, matching `docker compose --profile '*'`
    pub fn new<I, S>(profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut selection = Self::default();
        for p in profiles {
            let p = p.into();
            if p == "*" {
                selection.all = true;
            } else {
                selection.enabled.insert(p);
            }
        }
        selection
    }

    pub fn enables(&self, profiles: &BTreeSet<String>) -> bool {
        profiles.is_empty() || self.all || profiles.iter().any(|p| self.enabled.contains(p))
    }
}

/// All services, networks and secrets of one deployment snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceGraph {
    pub name: String,
    pub kind: SourceKind,
    pub services: BTreeMap<String, ServiceUnit>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretDef>,
}

impl ServiceGraph {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            services: BTreeMap::new(),
            networks: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceUnit> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Filter the graph down to the units that would actually run
    pub fn active_set(&self, selection: &ProfileSelection) -> ActiveSet<'_> {
        let units = self
            .services
            .iter()
            .filter(|(_, unit)| unit.is_active(selection))
            .map(|(name, unit)| (name.as_str(), unit))
            .collect();

        ActiveSet {
            label: self.name.clone(),
            kind: self.kind,
            units,
        }
    }
}

/// Services of one graph that survive profile and scale filtering
#[derive(Debug, Clone)]
pub struct ActiveSet<'a> {
    pub label: String,
    pub kind: SourceKind,
    units: BTreeMap<&'a str, &'a ServiceUnit>,
}

impl<'a> ActiveSet<'a> {
    pub fn names(&self) -> BTreeSet<&'a str> {
        self.units.keys().copied().collect()
    }

    pub fn get(&self, name: &str) -> Option<&'a ServiceUnit> {
        self.units.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> impl Iterator<Item = &'a ServiceUnit> + '_ {
        self.units.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(units: Vec<ServiceUnit>) -> ServiceGraph {
        let mut graph = ServiceGraph::new("test", SourceKind::Compose);
        for unit in units {
            graph.services.insert(unit.name.clone(), unit);
        }
        graph
    }

    fn tagged(name: &str, profiles: &[&str]) -> ServiceUnit {
        let mut unit = ServiceUnit::new(name);
        unit.profiles = profiles.iter().map(|p| p.to_string()).collect();
        unit
    }

    #[test]
    fn test_profiled_services_excluded_without_selection() {
        let graph = graph_with(vec![
            tagged("web", &[]),
            tagged("debug", &["extras"]),
            tagged("admin", &["ops", "extras"]),
        ]);

        let active = graph.active_set(&ProfileSelection::none());
        assert_eq!(active.names(), ["web"].into_iter().collect());
    }

    #[test]
    fn test_enabled_profile_includes_tagged_services() {
        let graph = graph_with(vec![
            tagged("web", &[]),
            tagged("debug", &["extras"]),
            tagged("admin", &["ops"]),
        ]);

        let active = graph.active_set(&ProfileSelection::new(["extras"]));
        assert!(active.contains("web"));
        assert!(active.contains("debug"));
        assert!(!active.contains("admin"));

        let everything = graph.active_set(&ProfileSelection::new(["*"]));
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn test_scaled_to_zero_is_inactive() {
        let mut unit = ServiceUnit::new("x");
        unit.is_scaled_to_zero = true;
        let graph = graph_with(vec![unit, ServiceUnit::new("y")]);

        let active = graph.active_set(&ProfileSelection::all());
        assert!(!active.contains("x"));
        assert!(active.contains("y"));
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!(RestartPolicy::parse("no"), Some(RestartPolicy::No));
        assert_eq!(
            RestartPolicy::parse("on-failure:5"),
            Some(RestartPolicy::OnFailure {
                max_attempts: Some(5)
            })
        );
        assert_eq!(RestartPolicy::parse("sometimes"), None);
        assert_eq!(
            RestartPolicy::parse("unless-stopped").unwrap().to_string(),
            "unless-stopped"
        );
    }

    #[test]
    fn test_network_mode_parse() {
        assert_eq!(
            NetworkMode::parse("service:vpn"),
            NetworkMode::Service("vpn".to_string())
        );
        assert_eq!(NetworkMode::parse("host"), NetworkMode::Host);
        assert_eq!(
            NetworkMode::parse("container:abc"),
            NetworkMode::Container("abc".to_string())
        );
    }

    #[test]
    fn test_volume_mount_kind() {
        let bind = VolumeMount {
            source: Some("./data".to_string()),
            target: "/data".to_string(),
            mode: Some("ro".to_string()),
        };
        let named = VolumeMount {
            source: Some("pgdata".to_string()),
            target: "/var/lib/postgresql/data".to_string(),
            mode: None,
        };
        assert!(bind.is_bind());
        assert!(bind.is_read_only());
        assert!(!named.is_bind());
        assert!(!named.is_read_only());
    }
}
