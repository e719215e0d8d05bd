//! Canonical model builder
//!
//! Lifts a merged Compose document or a set of Nomad jobs into a
//! [`ServiceGraph`] and checks that every reference inside it resolves.

use super::{
    DependencyCondition, Healthcheck, NetworkDef, NetworkMode, NetworkScope, PortMapping,
    Protocol, Resources, RestartPolicy, SecretDef, SecretRef, SecretSource, ServiceGraph,
    ServiceUnit, SourceKind, VolumeMount, DEFAULT_HEALTH_INTERVAL_MS, DEFAULT_HEALTH_RETRIES,
    DEFAULT_HEALTH_TIMEOUT_MS, SECRETS_DIR,
};
use crate::compose::config::{
    CommandConfig, ComposeFile, DependsOnConfig, EnvironmentConfig, HealthcheckConfig,
    HealthcheckTest, LabelsConfig, NetworksConfig, PortConfig, ScalarValue, ServiceConfig,
    ServiceSecretConfig, VolumeMountConfig,
};
use crate::config::{Settings, DEFAULT_CPU_MHZ_PER_CORE};
use crate::error::{IntegrityIssue, IssueKind, NomadicError, Result};
use crate::nomad::spec::{
    CheckSpec, GroupSpec, JobSpec, OrderingHint, RestartSpec, ServiceSpec, TaskSpec,
    SECRETS_TEMPLATE_DIR,
};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

/// Name of the network every Compose service joins implicitly
pub const DEFAULT_NETWORK: &str = "default";

const MIB: u64 = 1024 * 1024;

/// Builds canonical graphs from loader output
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    cpu_mhz_per_core: u32,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self {
            cpu_mhz_per_core: DEFAULT_CPU_MHZ_PER_CORE,
        }
    }
}

impl ModelBuilder {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cpu_mhz_per_core: settings.cpu_mhz_per_core,
        }
    }

    /// Build a graph from a merged Compose document
    pub fn from_compose(&self, doc: &ComposeFile, fallback_name: &str) -> Result<ServiceGraph> {
        let name = doc.name.clone().unwrap_or_else(|| fallback_name.to_string());
        let mut graph = ServiceGraph::new(name, SourceKind::Compose);

        for (net_name, config) in &doc.networks {
            let config = config.clone().unwrap_or_default();
            let driver = config.driver.unwrap_or_else(|| "bridge".to_string());
            let scope = if config.external.as_ref().map(|e| e.is_external()).unwrap_or(false) {
                NetworkScope::External
            } else if driver == "host" {
                NetworkScope::Host
            } else {
                NetworkScope::Internal
            };
            graph.networks.insert(
                net_name.clone(),
                NetworkDef {
                    name: net_name.clone(),
                    driver,
                    scope,
                },
            );
        }

        for (secret_name, config) in &doc.secrets {
            let source = if let Some(file) = &config.file {
                SecretSource::File(file.clone())
            } else if let Some(var) = &config.environment {
                SecretSource::Environment(var.clone())
            } else {
                SecretSource::External(config.name.clone().unwrap_or_else(|| secret_name.clone()))
            };
            graph.secrets.insert(
                secret_name.clone(),
                SecretDef {
                    name: secret_name.clone(),
                    source,
                },
            );
        }

        let mut problems = Vec::new();
        for (svc_name, config) in &doc.services {
            match self.compose_unit(svc_name, config, doc, &graph) {
                Ok(unit) => {
                    graph.services.insert(svc_name.clone(), unit);
                }
                Err(message) => problems.push(format!("service '{}': {}", svc_name, message)),
            }
        }

        if !problems.is_empty() {
            return Err(NomadicError::parse(graph.name.clone(), problems.join("; ")));
        }

        tracing::debug!(
            "Built compose graph '{}' with {} service(s)",
            graph.name,
            graph.len()
        );
        validate(&graph)?;
        Ok(graph)
    }

    fn compose_unit(
        &self,
        name: &str,
        config: &ServiceConfig,
        doc: &ComposeFile,
        graph: &ServiceGraph,
    ) -> std::result::Result<ServiceUnit, String> {
        let mut unit = ServiceUnit::new(name);
        unit.image = config.image.clone();
        unit.command = config.command.as_ref().map(command_vec).unwrap_or_default();
        unit.entrypoint = config.entrypoint.as_ref().map(command_vec).unwrap_or_default();
        unit.working_dir = config.working_dir.clone();
        unit.user = config.user.clone();

        match &config.environment {
            Some(EnvironmentConfig::Map(map)) => {
                for (key, value) in map {
                    match value {
                        Some(v) => {
                            unit.environment.insert(key.clone(), v.as_string());
                        }
                        None => {
                            unit.unmapped.insert(format!("environment:{}", key));
                        }
                    }
                }
            }
            Some(EnvironmentConfig::Array(items)) => {
                for item in items {
                    match item.split_once('=') {
                        Some((k, v)) => {
                            unit.environment.insert(k.to_string(), v.to_string());
                        }
                        None => {
                            unit.unmapped.insert(format!("environment:{}", item));
                        }
                    }
                }
            }
            None => {}
        }

        for port in config.ports.iter().flatten() {
            unit.ports.extend(parse_port(port)?);
        }

        for volume in config.volumes.iter().flatten() {
            unit.volumes.push(parse_volume(volume)?);
        }
        unit.volumes.sort();

        if let Some(networks) = &config.networks {
            unit.networks = networks.names().into_iter().collect();
            if let NetworksConfig::Map(map) = networks {
                if map.values().flatten().any(|n| n.aliases.is_some() || n.ipv4_address.is_some()) {
                    unit.unmapped.insert("networks.aliases".to_string());
                }
            }
        }

        match &config.depends_on {
            Some(DependsOnConfig::Array(deps)) => {
                for dep in deps {
                    unit.depends_on
                        .insert(dep.clone(), DependencyCondition::ServiceStarted);
                }
            }
            Some(DependsOnConfig::Map(deps)) => {
                for (dep, cond) in deps {
                    let condition = match cond.condition.as_deref() {
                        None => DependencyCondition::ServiceStarted,
                        Some(c) => DependencyCondition::parse(c)
                            .ok_or_else(|| format!("unknown depends_on condition '{}'", c))?,
                    };
                    if cond.required == Some(false) && !doc.services.contains_key(dep) {
                        tracing::debug!("Service '{}': optional dependency '{}' skipped", name, dep);
                        continue;
                    }
                    unit.depends_on.insert(dep.clone(), condition);
                }
            }
            None => {}
        }

        unit.profiles = config.profiles.iter().flatten().cloned().collect();

        if let Some(hc) = &config.healthcheck {
            match compose_healthcheck(hc)? {
                HealthcheckOutcome::Check(check) => unit.healthcheck = Some(check),
                HealthcheckOutcome::Disabled => {}
                HealthcheckOutcome::Inherited => {
                    unit.unmapped.insert("healthcheck".to_string());
                }
            }
        }

        if let Some(deploy) = &config.deploy {
            if let Some(replicas) = deploy.replicas {
                unit.replicas = replicas;
            }
            if let Some(resources) = &deploy.resources {
                if let Some(limits) = &resources.limits {
                    unit.resources = self.resources(limits.cpus.as_ref(), limits.memory.as_ref())?;
                    if limits.pids.is_some() {
                        unit.unmapped.insert("deploy.resources.limits.pids".to_string());
                    }
                }
                if resources.reservations.is_some() {
                    unit.unmapped.insert("deploy.resources.reservations".to_string());
                }
            }
            if let Some(policy) = &deploy.restart_policy {
                unit.restart_policy = Some(match policy.condition.as_deref() {
                    Some("none") => RestartPolicy::No,
                    Some("on-failure") => RestartPolicy::OnFailure {
                        max_attempts: policy.max_attempts,
                    },
                    Some("any") | None => RestartPolicy::Always,
                    Some(other) => return Err(format!("unknown restart condition '{}'", other)),
                });
            }
            for key in deploy.extra.keys() {
                unit.unmapped.insert(format!("deploy.{}", key));
            }
        }

        if let Some(restart) = &config.restart {
            unit.restart_policy = Some(
                RestartPolicy::parse(restart)
                    .ok_or_else(|| format!("unknown restart policy '{}'", restart))?,
            );
        }

        match &config.labels {
            Some(LabelsConfig::Map(map)) => {
                for (k, v) in map {
                    unit.labels.insert(k.clone(), v.as_string());
                }
            }
            Some(LabelsConfig::Array(items)) => {
                for item in items {
                    let (k, v) = item.split_once('=').unwrap_or((item.as_str(), ""));
                    unit.labels.insert(k.to_string(), v.to_string());
                }
            }
            None => {}
        }

        for secret in config.secrets.iter().flatten() {
            let (secret_name, target) = match secret {
                ServiceSecretConfig::Short(s) => (s.clone(), None),
                ServiceSecretConfig::Long(long) => (long.source.clone(), long.target.clone()),
            };
            let target = match target {
                Some(t) if t.starts_with('/') => t,
                Some(t) => format!("{}/{}", SECRETS_DIR, t),
                None => format!("{}/{}", SECRETS_DIR, secret_name),
            };
            let source = graph
                .secrets
                .get(&secret_name)
                .map(|d| d.source.clone())
                .unwrap_or_else(|| SecretSource::External(secret_name.clone()));
            unit.secrets.push(SecretRef {
                name: secret_name,
                source,
                target,
            });
        }

        if let Some(mode) = &config.network_mode {
            unit.network_mode = NetworkMode::parse(mode);
        }

        for (key, value) in &config.extra {
            match key.as_str() {
                "cpus" | "mem_limit" => {
                    let scalar = scalar_from_yaml(value);
                    let extra = if key == "cpus" {
                        self.resources(scalar.as_ref(), None)?
                    } else {
                        self.resources(None, scalar.as_ref())?
                    };
                    // deploy.resources.limits takes precedence
                    if let Some(extra) = extra {
                        let merged = unit.resources.get_or_insert_with(Resources::default);
                        merged.cpu_shares = merged.cpu_shares.or(extra.cpu_shares);
                        merged.memory_limit_bytes =
                            merged.memory_limit_bytes.or(extra.memory_limit_bytes);
                    }
                }
                "scale" if config.deploy.as_ref().and_then(|d| d.replicas).is_none() => {
                    if let Some(n) = value.as_u64() {
                        unit.replicas = n as u32;
                    }
                }
                _ => {
                    unit.unmapped.insert(key.clone());
                }
            }
        }

        Ok(unit)
    }

    fn resources(
        &self,
        cpus: Option<&ScalarValue>,
        memory: Option<&ScalarValue>,
    ) -> std::result::Result<Option<Resources>, String> {
        let cpu_shares = match cpus {
            Some(value) => {
                let cores = match value {
                    ScalarValue::Integer(i) => *i as f64,
                    ScalarValue::Float(f) => *f,
                    ScalarValue::Text(s) => s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| format!("invalid cpus value '{}'", s))?,
                    ScalarValue::Bool(_) => return Err("invalid cpus value".to_string()),
                };
                Some((cores * self.cpu_mhz_per_core as f64).round() as u32)
            }
            None => None,
        };

        let memory_limit_bytes = match memory {
            Some(ScalarValue::Integer(i)) if *i >= 0 => Some(*i as u64),
            Some(ScalarValue::Text(s)) => Some(
                parse_memory_bytes(s).ok_or_else(|| format!("invalid memory value '{}'", s))?,
            ),
            Some(other) => return Err(format!("invalid memory value '{}'", other.as_string())),
            None => None,
        };

        if cpu_shares.is_none() && memory_limit_bytes.is_none() {
            return Ok(None);
        }
        Ok(Some(Resources {
            cpu_shares,
            memory_limit_bytes,
        }))
    }

    /// Build a graph from loaded Nomad jobs
    pub fn from_nomad(&self, jobs: &[JobSpec]) -> Result<ServiceGraph> {
        let name = match jobs {
            [job] => job.name.clone(),
            [] => "nomad".to_string(),
            many => many.iter().map(|j| j.name.as_str()).collect::<Vec<_>>().join("+"),
        };
        let mut graph = ServiceGraph::new(name, SourceKind::Nomad);
        let mut issues = Vec::new();
        let mut origin: BTreeMap<String, String> = BTreeMap::new();

        for job in jobs {
            for group in &job.groups {
                let Some(primary) = group.tasks.first() else {
                    tracing::warn!("Group '{}' in job '{}' has no tasks", group.name, job.name);
                    continue;
                };

                for task in &group.tasks {
                    let location = format!("{}/{}", job.name, group.name);
                    if let Some(first) = origin.get(&task.name) {
                        issues.push(IntegrityIssue::new(
                            task.name.clone(),
                            format!("{} and {}", first, location),
                            IssueKind::DuplicateService,
                        ));
                        continue;
                    }
                    origin.insert(task.name.clone(), location);

                    let unit = nomad_unit(&job.name, group, task, &primary.name)?;
                    for network in &unit.networks {
                        graph
                            .networks
                            .entry(network.clone())
                            .or_insert_with(|| NetworkDef {
                                name: network.clone(),
                                driver: "bridge".to_string(),
                                scope: NetworkScope::Internal,
                            });
                    }
                    for secret in &unit.secrets {
                        graph
                            .secrets
                            .entry(secret.name.clone())
                            .or_insert_with(|| SecretDef {
                                name: secret.name.clone(),
                                source: secret.source.clone(),
                            });
                    }
                    graph.services.insert(task.name.clone(), unit);
                }
            }
        }

        issues.extend(integrity_issues(&graph));
        if !issues.is_empty() {
            return Err(NomadicError::Integrity(issues));
        }

        tracing::debug!(
            "Built nomad graph '{}' with {} service(s)",
            graph.name,
            graph.len()
        );
        Ok(graph)
    }
}

fn nomad_unit(job: &str, group: &GroupSpec, task: &TaskSpec, primary: &str) -> Result<ServiceUnit> {
    let mut unit = ServiceUnit::new(task.name.clone());
    let config = &task.config;

    if !config.image.is_empty() {
        unit.image = Some(config.image.clone());
    }
    if let Some(command) = &config.command {
        unit.command.push(command.clone());
    }
    unit.command.extend(config.args.iter().cloned());
    unit.entrypoint = config.entrypoint.clone();
    unit.working_dir = config.work_dir.clone();
    unit.user = task.user.clone();
    unit.environment = task.env.clone();
    unit.labels = task.meta.clone();

    for label in &config.ports {
        match group.port(label) {
            Some(port) => {
                let Some(container_port) = port.to.or(port.static_port) else {
                    tracing::warn!("Port '{}' in group '{}' has no port number", label, group.name);
                    continue;
                };
                unit.ports.push(PortMapping {
                    container_port,
                    host_port: port.static_port,
                    protocol: if label.ends_with("_udp") {
                        Protocol::Udp
                    } else {
                        Protocol::Tcp
                    },
                });
            }
            None => tracing::warn!(
                "Task '{}' references port '{}' not declared by group '{}'",
                task.name,
                label,
                group.name
            ),
        }
    }

    for bind in &config.volumes {
        unit.volumes.push(parse_volume_short(bind));
    }
    for mount in &task.volume_mounts {
        let source = group
            .volumes
            .iter()
            .find(|v| v.name == mount.volume)
            .map(|v| v.source.clone())
            .unwrap_or_else(|| mount.volume.clone());
        unit.volumes.push(VolumeMount {
            source: Some(source),
            target: mount.destination.clone(),
            mode: mount.read_only.map(|ro| if ro { "ro" } else { "rw" }.to_string()),
        });
    }
    unit.volumes.sort();

    for service in group
        .services
        .iter()
        .filter(|s| service_owner(s, primary) == task.name)
    {
        for tag in &service.tags {
            if let Some(network) = tag.strip_prefix("network:") {
                unit.networks.insert(network.to_string());
            }
        }
        if unit.healthcheck.is_none() {
            unit.healthcheck = service.checks.first().map(nomad_healthcheck);
        }
    }

    for template in &task.templates {
        let Some(secret_name) = template
            .destination
            .strip_prefix(SECRETS_TEMPLATE_DIR)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            continue;
        };
        let key = nomad_var_key(&template.data).unwrap_or_else(|| secret_name.to_string());
        let target = config
            .mounts
            .iter()
            .find(|m| m.source == template.destination)
            .map(|m| m.target.clone())
            .unwrap_or_else(|| format!("/{}", template.destination));
        unit.secrets.push(SecretRef {
            name: secret_name.to_string(),
            source: SecretSource::External(key),
            target,
        });
    }

    unit.restart_policy = task.restart.as_ref().or(group.restart.as_ref()).map(restart_policy);

    if let Some(res) = &task.resources {
        let memory_limit_bytes = match res.memory {
            Some(mib) => Some(mib.checked_mul(MIB).ok_or_else(|| NomadicError::Parse {
                source_name: job.to_string(),
                message: format!("task '{}': memory {} MiB is out of range", task.name, mib),
            })?),
            None => None,
        };
        unit.resources = Some(Resources {
            cpu_shares: res.cpu,
            memory_limit_bytes,
        });
    }

    unit.network_mode = if task.name != primary {
        NetworkMode::Service(primary.to_string())
    } else if let Some(mode) = &config.network_mode {
        NetworkMode::parse(mode)
    } else {
        match group.network.as_ref().map(|n| n.mode.as_str()) {
            Some("host") => NetworkMode::Host,
            Some("none") => NetworkMode::None,
            Some("bridge") | None => NetworkMode::Bridge,
            Some(other) => NetworkMode::Other(other.to_string()),
        }
    };

    for hint in &task.ordering {
        let condition = match hint {
            OrderingHint::HealthGate { .. } => DependencyCondition::ServiceHealthy,
            OrderingHint::Registration { .. } => DependencyCondition::ServiceStarted,
            OrderingHint::Completion { .. } => DependencyCondition::ServiceCompletedSuccessfully,
        };
        unit.depends_on.insert(hint.dependency().to_string(), condition);
    }

    unit.replicas = group.count;
    unit.is_scaled_to_zero = group.count == 0;
    unit.group = Some(group.name.clone());
    Ok(unit)
}

/// The task a service registration belongs to
fn service_owner<'a>(service: &'a ServiceSpec, primary: &'a str) -> &'a str {
    service
        .task
        .as_deref()
        .or_else(|| service.checks.iter().find_map(|c| c.task.as_deref()))
        .unwrap_or(primary)
}

fn nomad_healthcheck(check: &CheckSpec) -> Healthcheck {
    let command = match check.check_type.as_str() {
        "script" => check
            .command
            .iter()
            .cloned()
            .chain(check.args.iter().cloned())
            .collect(),
        "http" => vec![
            "HTTP".to_string(),
            check.path.clone().unwrap_or_else(|| "/".to_string()),
        ],
        other => vec![other.to_uppercase()],
    };

    Healthcheck {
        command,
        interval_ms: check.interval_ms,
        timeout_ms: check.timeout_ms,
        retries: check
            .check_restart
            .as_ref()
            .map(|cr| cr.limit)
            .unwrap_or(DEFAULT_HEALTH_RETRIES),
        start_period_ms: check.check_restart.as_ref().map(|cr| cr.grace_ms).unwrap_or(0),
    }
}

fn restart_policy(spec: &RestartSpec) -> RestartPolicy {
    match (spec.mode.as_str(), spec.attempts) {
        (_, Some(0)) => RestartPolicy::No,
        ("delay", _) => RestartPolicy::Always,
        (_, attempts) => RestartPolicy::OnFailure {
            max_attempts: attempts,
        },
    }
}

fn nomad_var_key(data: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r#"nomadVar\s+"([^"]+)""#).expect("valid nomadVar pattern"));
    pattern.captures(data).map(|c| c[1].to_string())
}

/// Check every reference in the graph; `Integrity` lists all problems
pub fn validate(graph: &ServiceGraph) -> Result<()> {
    let issues = integrity_issues(graph);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(NomadicError::Integrity(issues))
    }
}

fn integrity_issues(graph: &ServiceGraph) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();

    for (name, unit) in &graph.services {
        for dep in unit.depends_on.keys() {
            if !graph.services.contains_key(dep) {
                issues.push(IntegrityIssue::new(name, dep, IssueKind::UnknownDependency));
            }
        }
        for network in &unit.networks {
            if network != DEFAULT_NETWORK && !graph.networks.contains_key(network) {
                issues.push(IntegrityIssue::new(name, network, IssueKind::UnknownNetwork));
            }
        }
        for secret in &unit.secrets {
            if !graph.secrets.contains_key(&secret.name) {
                issues.push(IntegrityIssue::new(name, &secret.name, IssueKind::UnknownSecret));
            }
        }
        if let NetworkMode::Service(target) = &unit.network_mode {
            if !graph.services.contains_key(target) {
                issues.push(IntegrityIssue::new(
                    name,
                    target,
                    IssueKind::UnknownNetworkModeTarget,
                ));
            }
        }
    }

    let mut visited = HashSet::new();
    let mut visiting = HashSet::new();
    for name in graph.services.keys() {
        find_cycles(graph, name, &mut visited, &mut visiting, &mut issues);
    }

    issues
}

fn find_cycles(
    graph: &ServiceGraph,
    service: &str,
    visited: &mut HashSet<String>,
    visiting: &mut HashSet<String>,
    issues: &mut Vec<IntegrityIssue>,
) {
    if visited.contains(service) {
        return;
    }

    visiting.insert(service.to_string());

    if let Some(unit) = graph.services.get(service) {
        for dep in unit.depends_on.keys() {
            if visiting.contains(dep) {
                issues.push(IntegrityIssue::new(service, dep, IssueKind::DependencyCycle));
            } else if graph.services.contains_key(dep) {
                find_cycles(graph, dep, visited, visiting, issues);
            }
        }
    }

    visiting.remove(service);
    visited.insert(service.to_string());
}

enum HealthcheckOutcome {
    Check(Healthcheck),
    Disabled,
    /// No `test`: the image's own HEALTHCHECK applies
    Inherited,
}

fn compose_healthcheck(hc: &HealthcheckConfig) -> std::result::Result<HealthcheckOutcome, String> {
    if hc.disable == Some(true) {
        return Ok(HealthcheckOutcome::Disabled);
    }

    let command = match &hc.test {
        None => return Ok(HealthcheckOutcome::Inherited),
        Some(HealthcheckTest::Command(s)) if s.trim() == "NONE" => {
            return Ok(HealthcheckOutcome::Disabled)
        }
        Some(HealthcheckTest::Command(s)) => shell_wrap(s),
        Some(HealthcheckTest::Array(items)) => match items.split_first() {
            None => return Ok(HealthcheckOutcome::Disabled),
            Some((first, _)) if first == "NONE" => return Ok(HealthcheckOutcome::Disabled),
            Some((first, rest)) if first == "CMD" => rest.to_vec(),
            Some((first, rest)) if first == "CMD-SHELL" => shell_wrap(&rest.join(" ")),
            Some(_) => items.clone(),
        },
    };

    let duration = |value: &Option<String>, default: u64, field: &str| match value {
        Some(s) => parse_duration_ms(s).ok_or_else(|| format!("invalid healthcheck {} '{}'", field, s)),
        None => Ok(default),
    };

    Ok(HealthcheckOutcome::Check(Healthcheck {
        command,
        interval_ms: duration(&hc.interval, DEFAULT_HEALTH_INTERVAL_MS, "interval")?,
        timeout_ms: duration(&hc.timeout, DEFAULT_HEALTH_TIMEOUT_MS, "timeout")?,
        retries: hc.retries.unwrap_or(DEFAULT_HEALTH_RETRIES),
        start_period_ms: duration(&hc.start_period, 0, "start_period")?,
    }))
}

fn shell_wrap(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

fn command_vec(command: &CommandConfig) -> Vec<String> {
    match command {
        CommandConfig::Shell(s) => split_command(s),
        CommandConfig::Exec(v) => v.clone(),
    }
}

fn scalar_from_yaml(value: &serde_yaml::Value) -> Option<ScalarValue> {
    serde_yaml::from_value(value.clone()).ok()
}

/// Split a shell-style command line, honouring quotes and backslashes
pub fn split_command(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if in_word {
        args.push(current);
    }
    args
}

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)").expect("valid duration pattern")
    })
}

/// Parse a Go-style duration (`1m30s`, `500ms`, `2h`) into milliseconds,
/// rounding fractions of a millisecond up
pub fn parse_duration_ms(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "0" {
        return Some(0);
    }

    let mut total = 0f64;
    let mut consumed = 0;
    for caps in duration_pattern().captures_iter(s) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let factor = match &caps[2] {
            "ns" => 1e-6,
            "us" | "µs" => 1e-3,
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        total += value * factor;
    }

    if consumed == 0 || consumed != s.len() {
        return None;
    }
    Some(total.ceil() as u64)
}

/// Parse a Compose memory value (`512m`, `1g`, `1.5GiB`, `2048`) into bytes
pub fn parse_memory_bytes(s: &str) -> Option<u64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*([kmgt]?)(?:i?b)?\s*$").expect("valid memory pattern")
    });

    let caps = pattern.captures(s)?;
    let value: f64 = caps[1].parse().ok()?;
    let factor: u64 = match caps[2].to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => MIB,
        "g" => 1024 * MIB,
        "t" => 1024 * 1024 * MIB,
        _ => return None,
    };
    Some((value * factor as f64).round() as u64)
}

fn parse_protocol(s: &str) -> std::result::Result<Protocol, String> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => Err(format!("unsupported port protocol '{}'", other)),
    }
}

fn parse_port_range(s: &str) -> std::result::Result<Vec<u16>, String> {
    let invalid = || format!("invalid port '{}'", s);
    match s.split_once('-') {
        Some((lo, hi)) => {
            let lo: u16 = lo.trim().parse().map_err(|_| invalid())?;
            let hi: u16 = hi.trim().parse().map_err(|_| invalid())?;
            if lo > hi {
                return Err(invalid());
            }
            Ok((lo..=hi).collect())
        }
        None => s.trim().parse().map(|p| vec![p]).map_err(|_| invalid()),
    }
}

/// Expand one Compose port entry into mappings
pub fn parse_port(port: &PortConfig) -> std::result::Result<Vec<PortMapping>, String> {
    match port {
        PortConfig::Number(n) => Ok(vec![PortMapping {
            container_port: *n,
            host_port: None,
            protocol: Protocol::Tcp,
        }]),
        PortConfig::Long(long) => {
            let protocol = long
                .protocol
                .as_deref()
                .map(parse_protocol)
                .transpose()?
                .unwrap_or_default();
            let host_port = match &long.published {
                None => None,
                Some(ScalarValue::Integer(i)) => Some(
                    u16::try_from(*i).map_err(|_| format!("invalid published port '{}'", i))?,
                ),
                Some(ScalarValue::Text(t)) if t.is_empty() => None,
                Some(other) => {
                    let text = other.as_string();
                    let ports = parse_port_range(&text)?;
                    ports.first().copied()
                }
            };
            Ok(vec![PortMapping {
                container_port: long.target,
                host_port,
                protocol,
            }])
        }
        PortConfig::Short(s) => {
            let (body, protocol) = match s.rsplit_once('/') {
                Some((body, proto)) => (body, parse_protocol(proto)?),
                None => (s.as_str(), Protocol::Tcp),
            };

            let (rest, container) = match body.rsplit_once(':') {
                Some((rest, container)) => (Some(rest), container),
                None => (None, body),
            };
            let host = rest
                .map(|r| r.rsplit_once(':').map(|(_, h)| h).unwrap_or(r))
                .filter(|h| !h.is_empty());

            let containers = parse_port_range(container)?;
            let hosts = host.map(parse_port_range).transpose()?;

            match hosts {
                None => Ok(containers
                    .into_iter()
                    .map(|c| PortMapping {
                        container_port: c,
                        host_port: None,
                        protocol,
                    })
                    .collect()),
                Some(hosts) if hosts.len() == containers.len() => Ok(containers
                    .into_iter()
                    .zip(hosts)
                    .map(|(c, h)| PortMapping {
                        container_port: c,
                        host_port: Some(h),
                        protocol,
                    })
                    .collect()),
                Some(_) => Err(format!("port ranges in '{}' differ in length", s)),
            }
        }
    }
}

fn parse_volume(volume: &VolumeMountConfig) -> std::result::Result<VolumeMount, String> {
    match volume {
        VolumeMountConfig::Short(s) => Ok(parse_volume_short(s)),
        VolumeMountConfig::Long(long) => {
            let source = match long.mount_type.as_deref() {
                Some("tmpfs") => None,
                _ => long.source.clone().filter(|s| !s.is_empty()),
            };
            if long.target.is_empty() {
                return Err("volume without target".to_string());
            }
            Ok(VolumeMount {
                source,
                target: long.target.clone(),
                mode: long.read_only.filter(|ro| *ro).map(|_| "ro".to_string()),
            })
        }
    }
}

/// `target`, `source:target` or `source:target:mode`
pub fn parse_volume_short(s: &str) -> VolumeMount {
    let parts: Vec<&str> = s.splitn(3, ':').collect();
    match parts.as_slice() {
        [target] => VolumeMount {
            source: None,
            target: target.to_string(),
            mode: None,
        },
        [source, target] => VolumeMount {
            source: Some(source.to_string()),
            target: target.to_string(),
            mode: None,
        },
        [source, target, mode, ..] => VolumeMount {
            source: Some(source.to_string()),
            target: target.to_string(),
            mode: Some(mode.to_string()),
        },
        [] => VolumeMount {
            source: None,
            target: String::new(),
            mode: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeLoader;
    use crate::nomad::NomadLoader;
    use std::path::Path;

    fn compose_graph(yaml: &str) -> Result<ServiceGraph> {
        let doc = ComposeLoader::new().parse_str(yaml, "compose.yaml", Path::new("."))?;
        ModelBuilder::default().from_compose(&doc, "test")
    }

    #[test]
    fn test_environment_list_last_write_wins() {
        let graph = compose_graph(
            "services:\n  app:\n    image: x\n    environment:\n      - K=one\n      - K=two\n",
        )
        .unwrap();
        let app = graph.get("app").unwrap();
        assert_eq!(app.environment.get("K").map(String::as_str), Some("two"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ms("30s"), Some(30_000));
        assert_eq!(parse_duration_ms("1m30s"), Some(90_000));
        assert_eq!(parse_duration_ms("500ms"), Some(500));
        assert_eq!(parse_duration_ms("1h"), Some(3_600_000));
        assert_eq!(parse_duration_ms("1.5s"), Some(1_500));
        assert_eq!(parse_duration_ms("0"), Some(0));
        assert_eq!(parse_duration_ms("10"), None);
        assert_eq!(parse_duration_ms("10x"), None);
        assert_eq!(parse_duration_ms("abc10s"), None);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory_bytes("512m"), Some(512 * MIB));
        assert_eq!(parse_memory_bytes("1g"), Some(1024 * MIB));
        assert_eq!(parse_memory_bytes("1.5GiB"), Some(1536 * MIB));
        assert_eq!(parse_memory_bytes("2048"), Some(2048));
        assert_eq!(parse_memory_bytes("128MB"), Some(128 * MIB));
        assert_eq!(parse_memory_bytes("lots"), None);
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command(r#"sh -c "echo 'hi there'" done"#),
            vec!["sh", "-c", "echo 'hi there'", "done"]
        );
        assert_eq!(split_command("  a   b "), vec!["a", "b"]);
        assert_eq!(split_command(r#"echo """#), vec!["echo", ""]);
    }

    #[test]
    fn test_parse_port_forms() {
        assert_eq!(
            parse_port(&PortConfig::Short("8080:80".into())).unwrap(),
            vec![PortMapping {
                container_port: 80,
                host_port: Some(8080),
                protocol: Protocol::Tcp
            }]
        );
        assert_eq!(
            parse_port(&PortConfig::Short("127.0.0.1:53:53/udp".into())).unwrap(),
            vec![PortMapping {
                container_port: 53,
                host_port: Some(53),
                protocol: Protocol::Udp
            }]
        );
        assert_eq!(
            parse_port(&PortConfig::Short("9000-9001:8000-8001".into()))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            parse_port(&PortConfig::Short("3000".into())).unwrap()[0].host_port,
            None
        );
        assert!(parse_port(&PortConfig::Short("eighty".into())).is_err());
    }

    #[test]
    fn test_compose_unit_fields() {
        let graph = compose_graph(
            r#"
services:
  web:
    image: nginx:1.25
    command: nginx -g "daemon off;"
    ports: ["8080:80"]
    volumes:
      - ./html:/usr/share/nginx/html:ro
      - cache:/var/cache/nginx
    healthcheck:
      test: ["CMD-SHELL", "curl -f http://localhost/ || exit 1"]
      interval: 10s
    deploy:
      replicas: 2
      resources:
        limits:
          cpus: "0.5"
          memory: 256M
    restart: on-failure:3
    privileged: true
volumes:
  cache: {}
"#,
        )
        .unwrap();

        let web = graph.get("web").unwrap();
        assert_eq!(web.command, vec!["nginx", "-g", "daemon off;"]);
        assert_eq!(web.replicas, 2);
        assert_eq!(
            web.resources,
            Some(Resources {
                cpu_shares: Some(500),
                memory_limit_bytes: Some(256 * MIB)
            })
        );
        assert_eq!(
            web.restart_policy,
            Some(RestartPolicy::OnFailure {
                max_attempts: Some(3)
            })
        );
        let hc = web.healthcheck.as_ref().unwrap();
        assert_eq!(hc.command[0], "/bin/sh");
        assert_eq!(hc.interval_ms, 10_000);
        assert_eq!(hc.timeout_ms, DEFAULT_HEALTH_TIMEOUT_MS);
        assert_eq!(hc.retries, DEFAULT_HEALTH_RETRIES);
        assert_eq!(web.volumes.len(), 2);
        assert!(web.unmapped.contains("privileged"));
    }

    #[test]
    fn test_healthcheck_none_disables() {
        let graph = compose_graph(
            "services:\n  a:\n    image: x\n    healthcheck:\n      test: [\"NONE\"]\n",
        )
        .unwrap();
        assert!(graph.get("a").unwrap().healthcheck.is_none());
    }

    #[test]
    fn test_unknown_dependency_is_integrity_error() {
        let err = compose_graph("services:\n  a:\n    image: x\n    depends_on: [b]\n").unwrap_err();
        match err {
            NomadicError::Integrity(issues) => {
                assert_eq!(
                    issues,
                    vec![IntegrityIssue::new("a", "b", IssueKind::UnknownDependency)]
                );
            }
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_integrity_collects_all_problems() {
        let err = compose_graph(
            r#"
services:
  a:
    image: x
    depends_on: [b]
    networks: [backend]
    secrets: [token]
  c:
    image: x
    network_mode: "service:ghost"
"#,
        )
        .unwrap_err();
        match err {
            NomadicError::Integrity(issues) => {
                let kinds: Vec<IssueKind> = issues.into_iter().map(|i| i.kind).collect();
                assert_eq!(
                    kinds,
                    vec![
                        IssueKind::UnknownDependency,
                        IssueKind::UnknownNetwork,
                        IssueKind::UnknownSecret,
                        IssueKind::UnknownNetworkModeTarget,
                    ]
                );
            }
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_dependency_cycle_detected() {
        let err = compose_graph(
            "services:\n  a:\n    image: x\n    depends_on: [b]\n  b:\n    image: x\n    depends_on: [a]\n",
        )
        .unwrap_err();
        match err {
            NomadicError::Integrity(issues) => {
                assert!(issues.iter().any(|i| i.kind == IssueKind::DependencyCycle));
            }
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_default_network_is_implicit() {
        let graph =
            compose_graph("services:\n  a:\n    image: x\n    networks: [default]\n").unwrap();
        assert!(graph.networks.is_empty());
        assert!(graph.get("a").unwrap().networks.contains("default"));
    }

    #[test]
    fn test_nomad_scaled_to_zero() {
        let src = r#"
job "j" {
  group "g" {
    count = 0
    task "x" {
      driver = "docker"
      config {
        image = "busybox"
      }
    }
  }
}
"#;
        let jobs = NomadLoader::new().parse_str(src, "j.nomad").unwrap();
        let graph = ModelBuilder::default().from_nomad(&jobs).unwrap();
        let x = graph.get("x").unwrap();
        assert!(x.is_scaled_to_zero);
        assert_eq!(x.group.as_deref(), Some("g"));
        assert!(graph
            .active_set(&crate::model::ProfileSelection::all())
            .is_empty());
    }

    #[test]
    fn test_nomad_duplicate_task_names() {
        let src = r#"
job "j" {
  group "a" {
    task "web" {
      driver = "docker"
    }
  }
  group "b" {
    task "web" {
      driver = "docker"
    }
  }
}
"#;
        let jobs = NomadLoader::new().parse_str(src, "j.nomad").unwrap();
        let err = ModelBuilder::default().from_nomad(&jobs).unwrap_err();
        match err {
            NomadicError::Integrity(issues) => {
                assert_eq!(issues[0].kind, IssueKind::DuplicateService);
                assert_eq!(issues[0].service, "web");
            }
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_nomad_memory_out_of_range() {
        let src = r#"
job "j" {
  group "g" {
    task "x" {
      driver = "docker"
      resources {
        memory = 18000000000000000
      }
    }
  }
}
"#;
        let jobs = NomadLoader::new().parse_str(src, "j.nomad").unwrap();
        let err = ModelBuilder::default().from_nomad(&jobs).unwrap_err();
        match err {
            NomadicError::Parse { message, .. } => assert!(message.contains("memory")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_nomad_secondary_task_shares_primary_network() {
        let src = r#"
job "j" {
  group "vpn" {
    task "vpn" {
      driver = "docker"
      config {
        image = "wireguard"
      }
    }
    task "client" {
      driver = "docker"
      config {
        image = "curl"
      }
    }
  }
}
"#;
        let jobs = NomadLoader::new().parse_str(src, "j.nomad").unwrap();
        let graph = ModelBuilder::default().from_nomad(&jobs).unwrap();
        assert_eq!(
            graph.get("client").unwrap().network_mode,
            NetworkMode::Service("vpn".to_string())
        );
    }
}
