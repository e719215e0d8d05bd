//! Compose → Nomad translation
//!
//! [`Mapper::map`] turns a Compose [`ServiceGraph`] into a [`NomadJob`]:
//! one group per service (or per network-sharing set of services), one
//! docker task per service. Anything without a faithful Nomad counterpart is
//! reported as an [`UnsupportedFeatureWarning`]; the translation itself
//! never fails.

mod task;

use crate::config::{ProfileEmission, Settings};
use crate::model::{NetworkMode, ProfileSelection, RestartPolicy, ServiceGraph, ServiceUnit};
use crate::nomad::spec::{
    consul_service_name, GateSpec, GroupSpec, HostVolumeSpec, JobSpec, NetworkSpec, PortSpec,
    RestartSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A source construct that could not be translated faithfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsupportedFeatureWarning {
    /// Service the construct belongs to; `None` for project-level constructs
    pub service: Option<String>,
    pub feature: String,
    pub message: String,
}

impl UnsupportedFeatureWarning {
    pub fn new(
        service: Option<&str>,
        feature: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service: service.map(String::from),
            feature: feature.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for UnsupportedFeatureWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(service) => write!(f, "service '{}': {}: {}", service, self.feature, self.message),
            None => write!(f, "{}: {}", self.feature, self.message),
        }
    }
}

/// Translation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NomadJob {
    pub job: JobSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<UnsupportedFeatureWarning>,
}

/// Compose → Nomad mapper
#[derive(Debug, Clone)]
pub struct Mapper {
    settings: Settings,
}

/// Per-invocation translation state
struct Context<'a> {
    job_name: &'a str,
    settings: &'a Settings,
    /// Emitted units and whether each is active
    emitted: BTreeMap<&'a str, (&'a ServiceUnit, bool)>,
    /// Group each emitted unit lands in
    group_of: BTreeMap<&'a str, &'a str>,
    warnings: Vec<UnsupportedFeatureWarning>,
}

impl<'a> Context<'a> {
    fn warn(&mut self, service: Option<&str>, feature: impl Into<String>, message: impl Into<String>) {
        let warning = UnsupportedFeatureWarning::new(service, feature, message);
        tracing::debug!("{}", warning);
        self.warnings.push(warning);
    }
}

impl Mapper {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    /// Translate the services enabled by `selection` into one Nomad job
    pub fn map(
        &self,
        graph: &ServiceGraph,
        selection: &ProfileSelection,
        job_name: &str,
    ) -> NomadJob {
        let mut ctx = Context {
            job_name,
            settings: &self.settings,
            emitted: BTreeMap::new(),
            group_of: BTreeMap::new(),
            warnings: Vec::new(),
        };

        for (name, unit) in &graph.services {
            let active = unit.is_active(selection);
            if active || self.settings.profile_emission == ProfileEmission::ScaleToZero {
                ctx.emitted.insert(name.as_str(), (unit, active));
            } else {
                tracing::debug!("Service '{}' omitted: not in the enabled profiles", name);
            }
        }

        let groups = assign_groups(&mut ctx);

        let mut job = JobSpec::new(job_name);
        job.job_type = self.settings.job_type.clone();
        job.region = self.settings.region.clone();
        job.datacenters = self.settings.datacenters.clone();
        job.gate = GateSpec {
            image: self.settings.await_image.clone(),
            poll_seconds: self.settings.await_poll_seconds,
        };

        for (root, members) in &groups {
            let group = build_group(&mut ctx, graph, root, members);
            job.groups.push(group);
        }
        job.groups.sort_by(|a, b| a.name.cmp(&b.name));

        warn_network_drivers(&mut ctx, graph);

        tracing::debug!(
            "Mapped {} service(s) into {} group(s) with {} warning(s)",
            ctx.emitted.len(),
            job.groups.len(),
            ctx.warnings.len()
        );

        NomadJob {
            job,
            warnings: ctx.warnings,
        }
    }
}

/// Co-locate `network_mode: service:X` units with X; returns root → members,
/// root first
fn assign_groups<'a>(ctx: &mut Context<'a>) -> BTreeMap<&'a str, Vec<&'a str>> {
    let names: Vec<&'a str> = ctx.emitted.keys().copied().collect();
    let mut groups: BTreeMap<&'a str, Vec<&'a str>> = BTreeMap::new();

    for name in names {
        let root = resolve_root(ctx, name);
        ctx.group_of.insert(name, root);
        groups.entry(root).or_default();
    }

    for (name, root) in ctx.group_of.clone() {
        if let Some(members) = groups.get_mut(root) {
            if name == root {
                members.insert(0, name);
            } else {
                members.push(name);
            }
        }
    }

    groups
}

fn resolve_root<'a>(ctx: &mut Context<'a>, name: &'a str) -> &'a str {
    let mut current = name;
    let mut seen = BTreeSet::new();

    loop {
        seen.insert(current);
        let Some((unit, active)) = ctx.emitted.get(current).copied() else {
            return current;
        };
        let NetworkMode::Service(target) = &unit.network_mode else {
            return current;
        };

        match ctx.emitted.get_key_value(target.as_str()).map(|(k, v)| (*k, v.1)) {
            Some((target_name, target_active)) if target_active == active => {
                if seen.contains(target_name) {
                    ctx.warn(
                        Some(name),
                        "network_mode",
                        format!("circular network_mode chain through '{}'; placed in its own group", target),
                    );
                    return name;
                }
                current = target_name;
            }
            _ => {
                if current == name {
                    ctx.warn(
                        Some(name),
                        "network_mode",
                        format!(
                            "shares the network of '{}', which is not deployed alongside it; placed in its own group",
                            target
                        ),
                    );
                }
                return current;
            }
        }
    }
}

fn build_group(
    ctx: &mut Context<'_>,
    graph: &ServiceGraph,
    root: &str,
    members: &[&str],
) -> GroupSpec {
    let mut group = GroupSpec::new(root);
    let Some((root_unit, active)) = ctx.emitted.get(root).copied() else {
        return group;
    };

    group.count = if active { root_unit.replicas } else { 0 };

    let mode = match &root_unit.network_mode {
        NetworkMode::Bridge | NetworkMode::Service(_) => "bridge",
        NetworkMode::Host => "host",
        NetworkMode::None => {
            ctx.warn(
                Some(root),
                "network_mode",
                "network_mode none has no exact Nomad equivalent; group network mode set to none",
            );
            "none"
        }
        NetworkMode::Container(c) => {
            ctx.warn(
                Some(root),
                "network_mode",
                format!("container:{} cannot be expressed; using bridge networking", c),
            );
            "bridge"
        }
        NetworkMode::Other(o) => {
            ctx.warn(
                Some(root),
                "network_mode",
                format!("'{}' is not a Nomad network mode; using bridge networking", o),
            );
            "bridge"
        }
    };
    let mut network = NetworkSpec {
        mode: mode.to_string(),
        ports: Vec::new(),
    };

    group.restart = root_unit.restart_policy.as_ref().map(|p| restart_spec(ctx, root, p));

    for member in members {
        let Some((unit, _)) = ctx.emitted.get(*member).copied() else {
            continue;
        };

        if *member != root {
            if unit.replicas != root_unit.replicas {
                ctx.warn(
                    Some(*member),
                    "deploy.replicas",
                    format!("co-located with '{}'; the group count of {} applies", root, root_unit.replicas),
                );
            }
            if !unit.ports.is_empty() {
                ctx.warn(
                    Some(*member),
                    "ports",
                    format!("co-located with '{}'; ports are published on the shared group network", root),
                );
            }
        }

        for mapping in &unit.ports {
            let label = port_label(&unit.name, mapping);
            if network.ports.iter().any(|p| p.label == label) {
                continue;
            }
            network.ports.push(PortSpec {
                label,
                static_port: mapping.host_port,
                to: Some(mapping.container_port),
            });
        }

        for volume in unit.volumes.iter().filter(|v| !v.is_bind()) {
            if let Some(source) = &volume.source {
                if !group.volumes.iter().any(|v| &v.name == source) {
                    group.volumes.push(HostVolumeSpec {
                        name: source.clone(),
                        volume_type: "host".to_string(),
                        source: source.clone(),
                        read_only: false,
                    });
                }
            }
        }

        let mut task = task::build_task(ctx, graph, unit, root);
        if *member != root && unit.restart_policy != root_unit.restart_policy {
            task.restart = unit.restart_policy.as_ref().map(|p| restart_spec(ctx, member, p));
        }
        group.tasks.push(task);

        group.services.push(task::service_stanza(ctx, unit, &network));
    }

    group.network = Some(network);
    group
}

fn restart_spec(ctx: &mut Context<'_>, service: &str, policy: &RestartPolicy) -> RestartSpec {
    match policy {
        RestartPolicy::No => RestartSpec {
            attempts: Some(0),
            mode: "fail".to_string(),
        },
        RestartPolicy::OnFailure { max_attempts } => RestartSpec {
            attempts: *max_attempts,
            mode: "fail".to_string(),
        },
        RestartPolicy::Always => RestartSpec {
            attempts: None,
            mode: "delay".to_string(),
        },
        RestartPolicy::UnlessStopped => {
            ctx.warn(
                Some(service),
                "restart",
                "unless-stopped has no Nomad equivalent; restarting indefinitely like always",
            );
            RestartSpec {
                attempts: None,
                mode: "delay".to_string(),
            }
        }
    }
}

/// `<task>_<container>[_<host>][_udp]`, restricted to `[A-Za-z0-9_]`
pub fn port_label(task: &str, mapping: &crate::model::PortMapping) -> String {
    let base: String = task
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut label = format!("{}_{}", base, mapping.container_port);
    if let Some(host) = mapping.host_port {
        label.push_str(&format!("_{}", host));
    }
    if mapping.protocol == crate::model::Protocol::Udp {
        label.push_str("_udp");
    }
    label
}

/// Consul service name for a unit
pub fn service_name(unit: &ServiceUnit) -> String {
    consul_service_name(&unit.name)
}

fn warn_network_drivers(ctx: &mut Context<'_>, graph: &ServiceGraph) {
    let used: BTreeSet<&str> = ctx
        .emitted
        .values()
        .flat_map(|(unit, _)| unit.networks.iter().map(String::as_str))
        .collect();

    for name in used {
        if let Some(def) = graph.networks.get(name) {
            if def.driver != "bridge" {
                ctx.warn(
                    None,
                    format!("networks.{}", name),
                    format!(
                        "driver '{}' is not reproduced; only reachability through Consul tags is kept",
                        def.driver
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeLoader;
    use crate::model::ModelBuilder;
    use std::path::Path;

    fn graph(yaml: &str) -> ServiceGraph {
        let doc = ComposeLoader::new()
            .parse_str(yaml, "compose.yaml", Path::new("."))
            .unwrap();
        ModelBuilder::default().from_compose(&doc, "app").unwrap()
    }

    fn map(yaml: &str, settings: &Settings, selection: &ProfileSelection) -> NomadJob {
        Mapper::new(settings).map(&graph(yaml), selection, "app")
    }

    #[test]
    fn test_one_group_per_service() {
        let job = map(
            "services:\n  web:\n    image: nginx\n    ports: [\"8080:80\"]\n  db:\n    image: postgres\n",
            &Settings::default(),
            &ProfileSelection::none(),
        );
        let names: Vec<&str> = job.job.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);

        let web = job.job.group("web").unwrap();
        assert_eq!(web.tasks.len(), 1);
        let port = &web.network.as_ref().unwrap().ports[0];
        assert_eq!(port.label, "web_80_8080");
        assert_eq!(port.static_port, Some(8080));
        assert_eq!(port.to, Some(80));
        assert_eq!(web.tasks[0].config.ports, vec!["web_80_8080"]);
    }

    #[test]
    fn test_profiles_omit_and_scale_to_zero() {
        let yaml = "services:\n  a:\n    image: x\n  b:\n    image: y\n    profiles: [extras]\n";

        let omitted = map(yaml, &Settings::default(), &ProfileSelection::none());
        assert!(omitted.job.group("b").is_none());

        let settings = Settings {
            profile_emission: ProfileEmission::ScaleToZero,
            ..Settings::default()
        };
        let scaled = map(yaml, &settings, &ProfileSelection::none());
        assert_eq!(scaled.job.group("b").unwrap().count, 0);
        assert_eq!(scaled.job.group("a").unwrap().count, 1);
    }

    #[test]
    fn test_network_mode_service_colocates() {
        let job = map(
            r#"
services:
  vpn:
    image: wireguard
  app:
    image: app
    network_mode: "service:vpn"
  sidecar:
    image: side
    network_mode: "service:app"
"#,
            &Settings::default(),
            &ProfileSelection::none(),
        );
        assert_eq!(job.job.groups.len(), 1);
        let group = &job.job.groups[0];
        assert_eq!(group.name, "vpn");
        let tasks: Vec<&str> = group.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tasks, vec!["vpn", "app", "sidecar"]);
    }

    #[test]
    fn test_depends_on_becomes_gate_hint_and_warning() {
        let job = map(
            r#"
services:
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
"#,
            &Settings::default(),
            &ProfileSelection::none(),
        );
        let web = &job.job.group("web").unwrap().tasks[0];
        assert_eq!(
            web.ordering,
            vec![crate::nomad::OrderingHint::HealthGate {
                dependency: "db".to_string()
            }]
        );
        assert!(job
            .warnings
            .iter()
            .any(|w| w.feature == "depends_on" && w.service.as_deref() == Some("web")));
    }

    #[test]
    fn test_restart_mapping() {
        let job = map(
            r#"
services:
  a:
    image: x
    restart: "no"
  b:
    image: x
    restart: unless-stopped
"#,
            &Settings::default(),
            &ProfileSelection::none(),
        );
        assert_eq!(
            job.job.group("a").unwrap().restart,
            Some(RestartSpec {
                attempts: Some(0),
                mode: "fail".to_string()
            })
        );
        assert_eq!(job.job.group("b").unwrap().restart.as_ref().unwrap().mode, "delay");
        assert!(job.warnings.iter().any(|w| w.feature == "restart"));
    }

    #[test]
    fn test_unmapped_keys_warn_once_each() {
        let job = map(
            "services:\n  a:\n    image: x\n    privileged: true\n    cap_add: [NET_ADMIN]\n",
            &Settings::default(),
            &ProfileSelection::none(),
        );
        let features: Vec<&str> = job.warnings.iter().map(|w| w.feature.as_str()).collect();
        assert_eq!(features, vec!["cap_add", "privileged"]);
    }

    #[test]
    fn test_port_label() {
        let mapping = crate::model::PortMapping {
            container_port: 53,
            host_port: Some(5353),
            protocol: crate::model::Protocol::Udp,
        };
        assert_eq!(port_label("dns-cache", &mapping), "dns_cache_53_5353_udp");
    }
}
