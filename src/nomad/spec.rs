//! Nomad job types
//!
//! The subset of the Nomad job specification this crate reads and writes.
//! Durations are kept in milliseconds; the emitter renders whole seconds
//! as `"Ns"`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Docker task driver name
pub const DOCKER_DRIVER: &str = "docker";

/// Meta key naming the dependency a gate task waits for
pub const META_WAIT_FOR: &str = "wait_for";
/// Meta key naming the gate condition (`healthy`, `registered`, `completed`)
pub const META_WAIT_CONDITION: &str = "wait_condition";
/// Meta key naming the task a gate belongs to
pub const META_GATES: &str = "gates";
/// Meta key holding the extra wait after the dependency appears
pub const META_WAIT_GRACE: &str = "wait_grace";

/// Directory, relative to the task, that secret templates render into
pub const SECRETS_TEMPLATE_DIR: &str = "secrets";

/// One Nomad job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub datacenters: Vec<String>,
    /// How ordering hints are materialised as gate tasks
    pub gate: GateSpec,
    pub groups: Vec<GroupSpec>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: "service".to_string(),
            region: None,
            datacenters: vec!["dc1".to_string()],
            gate: GateSpec::default(),
            groups: Vec::new(),
        }
    }

    pub fn group(&self, name: &str) -> Option<&GroupSpec> {
        self.groups.iter().find(|g| g.name == name)
    }
}

/// Image and polling cadence of dependency gate tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    pub image: String,
    pub poll_seconds: u32,
}

impl Default for GateSpec {
    fn default() -> Self {
        Self {
            image: "busybox:1.36".to_string(),
            poll_seconds: 2,
        }
    }
}

/// Task group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<HostVolumeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartSpec>,
    pub tasks: Vec<TaskSpec>,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 1,
            network: None,
            volumes: Vec::new(),
            services: Vec::new(),
            restart: None,
            tasks: Vec::new(),
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn port(&self, label: &str) -> Option<&PortSpec> {
        self.network
            .as_ref()
            .and_then(|n| n.ports.iter().find(|p| p.label == label))
    }
}

/// Group network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
}

/// Labelled port in a group network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub label: String,
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub static_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<u16>,
}

/// Group `volume` stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVolumeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub volume_type: String,
    pub source: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Consul service registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Set when the stanza is declared inside a task instead of the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckSpec>,
}

/// Service check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    #[serde(rename = "type")]
    pub check_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_restart: Option<CheckRestartSpec>,
}

/// Restart the task after repeated check failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRestartSpec {
    pub limit: u32,
    pub grace_ms: u64,
}

/// Group or task `restart` stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    pub mode: String,
}

/// Docker driver configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Port labels declared by the group network
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Bind mounts as `source:target[:mode]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<DockerMount>,
}

/// Docker `mount` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerMount {
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Task `resources` stanza
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesSpec {
    /// MHz
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    /// MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// Task `volume_mount` stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMountSpec {
    pub volume: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// Task `template` stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub data: String,
    pub destination: String,
    pub change_mode: String,
}

/// Task `lifecycle` stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSpec {
    pub hook: String,
    #[serde(default)]
    pub sidecar: bool,
}

/// Start-ordering constraint on a task
///
/// Nomad has no cross-group start ordering, so each hint is materialised as
/// a prestart task that blocks until the dependency shows up in Consul.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderingHint {
    /// Wait until the dependency's checks pass
    HealthGate { dependency: String },
    /// Wait until the dependency is registered, then a grace period
    Registration {
        dependency: String,
        grace_seconds: u32,
    },
    /// Best effort stand-in for "ran to completion"
    Completion {
        dependency: String,
        grace_seconds: u32,
    },
}

impl OrderingHint {
    pub fn dependency(&self) -> &str {
        match self {
            OrderingHint::HealthGate { dependency }
            | OrderingHint::Registration { dependency, .. }
            | OrderingHint::Completion { dependency, .. } => dependency,
        }
    }

    /// Value written to the gate task's `wait_condition` meta key
    pub fn condition(&self) -> &'static str {
        match self {
            OrderingHint::HealthGate { .. } => "healthy",
            OrderingHint::Registration { .. } => "registered",
            OrderingHint::Completion { .. } => "completed",
        }
    }

    pub fn grace_seconds(&self) -> u32 {
        match self {
            OrderingHint::HealthGate { .. } => 0,
            OrderingHint::Registration { grace_seconds, .. }
            | OrderingHint::Completion { grace_seconds, .. } => *grace_seconds,
        }
    }

    /// Rebuild a hint from gate task meta
    pub fn from_condition(condition: &str, dependency: String, grace_seconds: u32) -> Option<Self> {
        match condition {
            "healthy" => Some(OrderingHint::HealthGate { dependency }),
            "registered" => Some(OrderingHint::Registration {
                dependency,
                grace_seconds,
            }),
            "completed" => Some(OrderingHint::Completion {
                dependency,
                grace_seconds,
            }),
            _ => None,
        }
    }
}

/// One task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub driver: String,
    pub config: DockerConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMountSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ordering: Vec<OrderingHint>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: DOCKER_DRIVER.to_string(),
            config: DockerConfig {
                image: image.into(),
                ..DockerConfig::default()
            },
            env: BTreeMap::new(),
            meta: BTreeMap::new(),
            user: None,
            resources: None,
            volume_mounts: Vec::new(),
            templates: Vec::new(),
            restart: None,
            lifecycle: None,
            ordering: Vec::new(),
        }
    }

    /// Prestart, non-sidecar task that only waits for a dependency
    pub fn is_gate(&self) -> bool {
        self.lifecycle
            .as_ref()
            .map(|l| l.hook == "prestart" && !l.sidecar)
            .unwrap_or(false)
            && self.meta.contains_key(META_WAIT_FOR)
    }
}

/// Name of the gate task emitted for `task` waiting on `dependency`
pub fn gate_task_name(task: &str, dependency: &str) -> String {
    format!("{}-await-{}", task, dependency)
}

/// Consul service name used for a task: lowercase, `[a-z0-9-]` only
pub fn consul_service_name(task: &str) -> String {
    let name: String = task
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_hint_condition_roundtrip() {
        let hint = OrderingHint::Registration {
            dependency: "db".to_string(),
            grace_seconds: 5,
        };
        let rebuilt =
            OrderingHint::from_condition(hint.condition(), "db".to_string(), hint.grace_seconds());
        assert_eq!(rebuilt, Some(hint));
        assert!(OrderingHint::from_condition("eventually", "db".to_string(), 0).is_none());
    }

    #[test]
    fn test_gate_detection() {
        let mut task = TaskSpec::new("web-await-db", "busybox:1.36");
        assert!(!task.is_gate());

        task.lifecycle = Some(LifecycleSpec {
            hook: "prestart".to_string(),
            sidecar: false,
        });
        task.meta.insert(META_WAIT_FOR.to_string(), "db".to_string());
        assert!(task.is_gate());

        task.lifecycle = Some(LifecycleSpec {
            hook: "prestart".to_string(),
            sidecar: true,
        });
        assert!(!task.is_gate());
    }

    #[test]
    fn test_consul_service_name() {
        assert_eq!(consul_service_name("My_App.v2"), "my-app-v2");
        assert_eq!(consul_service_name("web"), "web");
    }

    #[test]
    fn test_hint_serializes_with_kind_tag() {
        let hint = OrderingHint::HealthGate {
            dependency: "db".to_string(),
        };
        let json = serde_json::to_string(&hint).unwrap();
        assert_eq!(json, r#"{"kind":"health_gate","dependency":"db"}"#);
    }
}
