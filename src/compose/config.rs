//! Docker Compose document types
//!
//! Only the keys that have a translation rule are typed. Everything else a
//! service declares lands in `extra` so the mapper can report it instead of
//! dropping it silently.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Docker Compose file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Obsolete version field
    #[serde(default)]
    pub version: Option<String>,
    /// Included documents
    #[serde(default)]
    pub include: Vec<IncludeEntry>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(default)]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    /// Volumes
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
    /// Secrets
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretConfig>,
    /// Top-level keys without a mapping (`configs`, `x-*` extensions)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// `include:` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncludeEntry {
    /// Short syntax: a single path
    Short(String),
    /// Long syntax
    Long(IncludeLong),
}

/// Long `include:` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludeLong {
    /// One path or several paths merged in order
    pub path: StringOrList,
    /// Project directory override
    #[serde(default)]
    pub project_directory: Option<String>,
    /// Env file used for interpolation of the included document
    #[serde(default)]
    pub env_file: Option<StringOrList>,
}

impl IncludeEntry {
    /// Paths listed by this entry, in order
    pub fn paths(&self) -> Vec<String> {
        match self {
            IncludeEntry::Short(p) => vec![p.clone()],
            IncludeEntry::Long(long) => long.path.to_vec(),
        }
    }
}

/// A value written either as a string or as a list of strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    List(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => vec![s.clone()],
            StringOrList::List(l) => l.clone(),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default)]
    pub entrypoint: Option<CommandConfig>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Environment files
    #[serde(default)]
    pub env_file: Option<StringOrList>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default)]
    pub volumes: Option<Vec<VolumeMountConfig>>,
    /// Networks to connect to
    #[serde(default)]
    pub networks: Option<NetworksConfig>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    /// Deploy configuration
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
    /// Healthcheck configuration
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Restart policy
    #[serde(default)]
    pub restart: Option<String>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<String>,
    /// User
    #[serde(default)]
    pub user: Option<String>,
    /// Secrets
    #[serde(default)]
    pub secrets: Option<Vec<ServiceSecretConfig>>,
    /// Network mode
    #[serde(default)]
    pub network_mode: Option<String>,
    /// Profiles
    #[serde(default)]
    pub profiles: Option<Vec<String>>,
    /// Keys without a translation rule (`build`, `cap_add`, `privileged`, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<ScalarValue>>),
}

/// YAML scalar that may be written as a number, bool or string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    pub fn as_string(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Integer(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::Text(s) => s.clone(),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port: `80`
    Number(u16),
    /// Short syntax: "8080:80/udp"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default)]
    pub published: Option<ScalarValue>,
    /// Host IP to bind to
    #[serde(default)]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    #[serde(default)]
    pub protocol: Option<String>,
    /// Mode (host/ingress)
    #[serde(default)]
    pub mode: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMountConfig {
    /// Short syntax: "host:container:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind, tmpfs, npipe)
    #[serde(rename = "type", default)]
    pub mount_type: Option<String>,
    /// Source path or volume name
    #[serde(default)]
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    #[serde(default)]
    pub read_only: Option<bool>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to config
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

impl NetworksConfig {
    pub fn names(&self) -> Vec<String> {
        match self {
            NetworksConfig::Array(arr) => arr.clone(),
            NetworksConfig::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Service network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    /// Aliases
    #[serde(default)]
    pub aliases: Option<Vec<String>>,
    /// IPv4 address
    #[serde(default)]
    pub ipv4_address: Option<String>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default)]
    pub condition: Option<String>,
    /// Restart dependents when the dependency is updated
    #[serde(default)]
    pub restart: Option<bool>,
    /// Whether the dependency must exist
    #[serde(default)]
    pub required: Option<bool>,
}

/// Deploy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Number of replicas
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Resource limits and reservations
    #[serde(default)]
    pub resources: Option<ResourcesConfig>,
    /// Restart policy
    #[serde(default)]
    pub restart_policy: Option<RestartPolicyConfig>,
    /// Keys without a translation rule (placement, update_config, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Resources configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Resource limits
    #[serde(default)]
    pub limits: Option<ResourceSpec>,
    /// Resource reservations
    #[serde(default)]
    pub reservations: Option<ResourceSpec>,
}

/// Resource specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU limit/reservation, e.g. `0.5` or `"1.5"`
    #[serde(default)]
    pub cpus: Option<ScalarValue>,
    /// Memory limit/reservation, e.g. `512M`
    #[serde(default)]
    pub memory: Option<ScalarValue>,
    /// PIDs limit
    #[serde(default)]
    pub pids: Option<i64>,
}

/// Restart policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    /// Condition (none, on-failure, any)
    #[serde(default)]
    pub condition: Option<String>,
    /// Maximum attempts
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default)]
    pub test: Option<HealthcheckTest>,
    /// Interval
    #[serde(default)]
    pub interval: Option<String>,
    /// Timeout
    #[serde(default)]
    pub timeout: Option<String>,
    /// Retries
    #[serde(default)]
    pub retries: Option<u32>,
    /// Start period
    #[serde(default)]
    pub start_period: Option<String>,
    /// Disable healthcheck
    #[serde(default)]
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, ScalarValue>),
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    #[serde(default)]
    pub driver: Option<String>,
    /// External network
    #[serde(default)]
    pub external: Option<ExternalConfig>,
    /// Internal network
    #[serde(default)]
    pub internal: Option<bool>,
    /// Name
    #[serde(default)]
    pub name: Option<String>,
    /// Keys without a translation rule (ipam, driver_opts, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    #[serde(default)]
    pub driver: Option<String>,
    /// External volume
    #[serde(default)]
    pub external: Option<ExternalConfig>,
    /// Name
    #[serde(default)]
    pub name: Option<String>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name
    Named { name: String },
}

impl ExternalConfig {
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }
}

/// Secret configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretConfig {
    /// File path
    #[serde(default)]
    pub file: Option<String>,
    /// Environment variable
    #[serde(default)]
    pub environment: Option<String>,
    /// External secret
    #[serde(default)]
    pub external: Option<ExternalConfig>,
    /// Name
    #[serde(default)]
    pub name: Option<String>,
}

/// Secret reference in service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceSecretConfig {
    /// Short syntax
    Short(String),
    /// Long syntax
    Long(ServiceSecretLong),
}

/// Long secret reference
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSecretLong {
    /// Source secret name
    pub source: String,
    /// Target path in container
    #[serde(default)]
    pub target: Option<String>,
    /// Mode
    #[serde(default)]
    pub mode: Option<u32>,
}
