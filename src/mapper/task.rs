//! Per-service translation: the docker task and its Consul registration

use super::{port_label, service_name, Context};
use crate::model::{DependencyCondition, Healthcheck, ServiceGraph, ServiceUnit, SecretSource};
use crate::nomad::spec::{
    CheckRestartSpec, CheckSpec, DockerMount, NetworkSpec, OrderingHint, ResourcesSpec,
    ServiceSpec, TaskSpec, TemplateSpec, VolumeMountSpec, SECRETS_TEMPLATE_DIR,
};

const MIB: u64 = 1024 * 1024;

pub(super) fn build_task(
    ctx: &mut Context<'_>,
    graph: &ServiceGraph,
    unit: &ServiceUnit,
    group_root: &str,
) -> TaskSpec {
    let name = unit.name.as_str();

    let image = match &unit.image {
        Some(image) => image.clone(),
        None => {
            let image = format!("{}-{}:latest", ctx.job_name, name);
            let message = if unit.unmapped.contains("build") {
                format!("images are not built by Nomad; push the build output as '{}'", image)
            } else {
                format!("no image declared; assuming '{}'", image)
            };
            ctx.warn(Some(name), "build", message);
            image
        }
    };

    let mut task = TaskSpec::new(name, image);

    if let Some((command, args)) = unit.command.split_first() {
        task.config.command = Some(command.clone());
        task.config.args = args.to_vec();
    }
    task.config.entrypoint = unit.entrypoint.clone();
    task.config.work_dir = unit.working_dir.clone();
    task.user = unit.user.clone();
    task.env = unit.environment.clone();
    task.meta = unit.labels.clone();

    for mapping in &unit.ports {
        let label = port_label(name, mapping);
        if !task.config.ports.contains(&label) {
            task.config.ports.push(label);
        }
    }

    for volume in &unit.volumes {
        let Some(source) = &volume.source else {
            ctx.warn(
                Some(name),
                "volumes",
                format!("anonymous volume at '{}' has no Nomad equivalent", volume.target),
            );
            continue;
        };

        if volume.is_bind() {
            if !source.starts_with('/') {
                ctx.warn(
                    Some(name),
                    "volumes",
                    format!(
                        "bind source '{}' is resolved relative to the task directory on the client",
                        source
                    ),
                );
            }
            let mut entry = format!("{}:{}", source, volume.target);
            if let Some(mode) = &volume.mode {
                entry.push(':');
                entry.push_str(mode);
            }
            task.config.volumes.push(entry);
        } else {
            let read_only = match volume.mode.as_deref() {
                None => None,
                Some("ro") => Some(true),
                Some("rw") => Some(false),
                Some(other) => {
                    ctx.warn(
                        Some(name),
                        "volumes",
                        format!("mount options '{}' on volume '{}' are reduced to read_only", other, source),
                    );
                    Some(volume.is_read_only())
                }
            };
            task.volume_mounts.push(VolumeMountSpec {
                volume: source.clone(),
                destination: volume.target.clone(),
                read_only,
            });
        }
    }

    if let Some(resources) = &unit.resources {
        let memory = resources.memory_limit_bytes.map(|bytes| {
            if bytes % MIB != 0 {
                ctx.warn(
                    Some(name),
                    "deploy.resources.limits.memory",
                    format!("{} bytes rounded up to whole MiB", bytes),
                );
            }
            bytes.div_ceil(MIB)
        });
        task.resources = Some(ResourcesSpec {
            cpu: resources.cpu_shares,
            memory,
        });
    }

    for secret in &unit.secrets {
        let key = format!("nomad/jobs/{}/{}", ctx.job_name, secret.name);
        let destination = format!("{}/{}", SECRETS_TEMPLATE_DIR, secret.name);

        if let SecretSource::File(path) = &secret.source {
            tracing::info!(
                "Secret '{}' (from {}) must be stored in Nomad variable '{}'",
                secret.name,
                path,
                key
            );
        }

        task.templates.push(TemplateSpec {
            data: format!(
                "{{{{ with nomadVar \"{}\" }}}}{{{{ .value }}}}{{{{ end }}}}",
                key
            ),
            destination: destination.clone(),
            change_mode: "restart".to_string(),
        });
        task.config.mounts.push(DockerMount {
            mount_type: "bind".to_string(),
            source: destination,
            target: secret.target.clone(),
            readonly: true,
        });
    }

    for (dep, condition) in &unit.depends_on {
        if let Some(hint) = ordering_hint(ctx, graph, unit, dep, *condition, group_root) {
            task.ordering.push(hint);
        }
    }

    for key in &unit.unmapped {
        if key == "build" && unit.image.is_none() {
            continue;
        }
        let (feature, message) = match key.split_once(':') {
            Some(("environment", var)) => (
                "environment".to_string(),
                format!("variable '{}' is not set in the loading environment and was dropped", var),
            ),
            _ => (key.clone(), "no Nomad equivalent; dropped".to_string()),
        };
        ctx.warn(Some(name), feature, message);
    }

    task
}

fn ordering_hint(
    ctx: &mut Context<'_>,
    graph: &ServiceGraph,
    unit: &ServiceUnit,
    dep: &str,
    condition: DependencyCondition,
    group_root: &str,
) -> Option<OrderingHint> {
    let name = unit.name.as_str();
    let self_active = ctx.emitted.get(name).map(|(_, a)| *a).unwrap_or(false);

    let dropped = match ctx.emitted.get(dep) {
        None => Some(format!("'{}' is not deployed; start ordering dropped", dep)),
        Some((_, dep_active)) if self_active && !dep_active => Some(format!(
            "'{}' is scaled to zero; start ordering dropped",
            dep
        )),
        Some(_) if ctx.group_of.get(dep).copied() == Some(group_root) => Some(format!(
            "'{}' shares this group; Nomad starts group tasks together",
            dep
        )),
        Some(_) => None,
    };

    if let Some(message) = dropped {
        ctx.warn(Some(name), "depends_on", message);
        return None;
    }

    let grace_seconds = ctx.settings.registration_grace_seconds;
    let hint = match condition {
        DependencyCondition::ServiceHealthy => OrderingHint::HealthGate {
            dependency: dep.to_string(),
        },
        DependencyCondition::ServiceStarted => OrderingHint::Registration {
            dependency: dep.to_string(),
            grace_seconds,
        },
        DependencyCondition::ServiceCompletedSuccessfully => OrderingHint::Completion {
            dependency: dep.to_string(),
            grace_seconds,
        },
    };

    let without_check = graph
        .get(dep)
        .map(|d| d.healthcheck.is_none())
        .unwrap_or(true);
    let mut message = format!(
        "{} on '{}' is approximated by a prestart task polling Consul",
        condition.as_str(),
        dep
    );
    match &hint {
        OrderingHint::HealthGate { .. } if without_check => {
            message.push_str(&format!(
                "; '{}' has no healthcheck, so registration alone passes the gate",
                dep
            ));
        }
        OrderingHint::Completion { .. } => {
            message.push_str("; completion is not observable, registration plus a grace period stands in")
        }
        _ => {}
    }

    ctx.warn(Some(name), "depends_on", message);

    Some(hint)
}

/// Consul registration carrying network tags and the healthcheck
pub(super) fn service_stanza(
    ctx: &mut Context<'_>,
    unit: &ServiceUnit,
    network: &NetworkSpec,
) -> ServiceSpec {
    let port = unit
        .ports
        .first()
        .map(|m| port_label(&unit.name, m))
        .filter(|label| network.ports.iter().any(|p| &p.label == label));

    let mut service = ServiceSpec {
        name: service_name(unit),
        port,
        provider: "consul".to_string(),
        tags: unit.networks.iter().map(|n| format!("network:{}", n)).collect(),
        task: Some(unit.name.clone()),
        checks: Vec::new(),
    };

    if let Some(hc) = &unit.healthcheck {
        if let Some(check) = check(ctx, &unit.name, hc) {
            service.checks.push(check);
        }
    }

    service
}

fn check(ctx: &mut Context<'_>, service: &str, hc: &Healthcheck) -> Option<CheckSpec> {
    let Some((command, args)) = hc.command.split_first() else {
        ctx.warn(Some(service), "healthcheck", "empty test command; no check emitted");
        return None;
    };

    if hc.retries > 0 {
        ctx.warn(
            Some(service),
            "healthcheck.retries",
            format!(
                "{} failed check(s) restart the task; Compose only marks the container unhealthy",
                hc.retries
            ),
        );
    }

    Some(CheckSpec {
        check_type: "script".to_string(),
        task: None,
        command: Some(command.clone()),
        args: args.to_vec(),
        path: None,
        interval_ms: whole_seconds(ctx, service, "interval", hc.interval_ms),
        timeout_ms: whole_seconds(ctx, service, "timeout", hc.timeout_ms),
        check_restart: Some(CheckRestartSpec {
            limit: hc.retries,
            grace_ms: whole_seconds(ctx, service, "start_period", hc.start_period_ms),
        }),
    })
}

/// Round a millisecond duration up to whole seconds, warning when that changes it
fn whole_seconds(ctx: &mut Context<'_>, service: &str, field: &str, ms: u64) -> u64 {
    if ms % 1000 == 0 {
        return ms;
    }
    let rounded = ms.div_ceil(1000) * 1000;
    ctx.warn(
        Some(service),
        format!("healthcheck.{}", field),
        format!("{}ms rounded up to {}s", ms, rounded / 1000),
    );
    rounded
}

#[cfg(test)]
mod tests {
    use crate::compose::ComposeLoader;
    use crate::config::Settings;
    use crate::mapper::{Mapper, NomadJob};
    use crate::model::{ModelBuilder, ProfileSelection};
    use crate::nomad::OrderingHint;
    use std::path::Path;

    fn map(yaml: &str) -> NomadJob {
        let doc = ComposeLoader::new()
            .parse_str(yaml, "compose.yaml", Path::new("."))
            .unwrap();
        let graph = ModelBuilder::default().from_compose(&doc, "app").unwrap();
        Mapper::new(&Settings::default()).map(&graph, &ProfileSelection::none(), "app")
    }

    #[test]
    fn test_task_fields() {
        let job = map(
            r#"
services:
  api:
    image: api:2
    command: ["serve", "--port", "9000"]
    entrypoint: ["/entry.sh"]
    working_dir: /srv
    user: "1000"
    environment:
      LOG_LEVEL: info
    labels:
      team: core
"#,
        );
        let task = &job.job.groups[0].tasks[0];
        assert_eq!(task.config.image, "api:2");
        assert_eq!(task.config.command.as_deref(), Some("serve"));
        assert_eq!(task.config.args, vec!["--port", "9000"]);
        assert_eq!(task.config.entrypoint, vec!["/entry.sh"]);
        assert_eq!(task.config.work_dir.as_deref(), Some("/srv"));
        assert_eq!(task.user.as_deref(), Some("1000"));
        assert_eq!(task.env.get("LOG_LEVEL").map(String::as_str), Some("info"));
        assert_eq!(task.meta.get("team").map(String::as_str), Some("core"));
        assert!(job.warnings.is_empty());
    }

    #[test]
    fn test_volumes() {
        let job = map(
            r#"
services:
  db:
    image: postgres
    volumes:
      - pgdata:/var/lib/postgresql/data:rw
      - /etc/pg/conf:/etc/postgresql:ro
volumes:
  pgdata: {}
"#,
        );
        let group = &job.job.groups[0];
        assert_eq!(group.volumes[0].name, "pgdata");
        let task = &group.tasks[0];
        assert_eq!(task.config.volumes, vec!["/etc/pg/conf:/etc/postgresql:ro"]);
        assert_eq!(task.volume_mounts[0].destination, "/var/lib/postgresql/data");
        assert_eq!(task.volume_mounts[0].read_only, Some(false));
    }

    #[test]
    fn test_memory_rounds_up_with_warning() {
        let job = map(
            r#"
services:
  a:
    image: x
    deploy:
      resources:
        limits:
          cpus: "1.5"
          memory: 1000000
"#,
        );
        let resources = job.job.groups[0].tasks[0].resources.as_ref().unwrap();
        assert_eq!(resources.cpu, Some(1500));
        assert_eq!(resources.memory, Some(1));
        assert!(job
            .warnings
            .iter()
            .any(|w| w.feature == "deploy.resources.limits.memory"));
    }

    #[test]
    fn test_secret_becomes_template() {
        let job = map(
            r#"
services:
  app:
    image: x
    secrets:
      - db_password
secrets:
  db_password:
    file: ./db_password.txt
"#,
        );
        let task = &job.job.groups[0].tasks[0];
        assert_eq!(task.templates.len(), 1);
        assert!(task.templates[0]
            .data
            .contains("nomadVar \"nomad/jobs/app/db_password\""));
        assert_eq!(task.templates[0].destination, "secrets/db_password");
        assert_eq!(task.config.mounts[0].target, "/run/secrets/db_password");
        assert!(task.config.mounts[0].readonly);
    }

    #[test]
    fn test_healthcheck_rounding_warns() {
        let job = map(
            r#"
services:
  a:
    image: x
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 1500ms
      timeout: 5s
      retries: 4
"#,
        );
        let service = &job.job.groups[0].services[0];
        let check = &service.checks[0];
        assert_eq!(check.command.as_deref(), Some("pg_isready"));
        assert_eq!(check.interval_ms, 2_000);
        assert_eq!(check.timeout_ms, 5_000);
        assert_eq!(check.check_restart.as_ref().unwrap().limit, 4);
        assert!(job
            .warnings
            .iter()
            .any(|w| w.feature == "healthcheck.interval"));
        assert!(job
            .warnings
            .iter()
            .any(|w| w.feature == "healthcheck.retries" && w.service.as_deref() == Some("a")));
    }

    #[test]
    fn test_dependency_on_omitted_service_is_dropped() {
        let job = map(
            r#"
services:
  web:
    image: x
    depends_on: [debug]
  debug:
    image: y
    profiles: [extras]
"#,
        );
        let task = &job.job.groups[0].tasks[0];
        assert!(task.ordering.is_empty());
        assert!(job
            .warnings
            .iter()
            .any(|w| w.feature == "depends_on" && w.message.contains("not deployed")));
    }

    #[test]
    fn test_started_dependency_uses_registration_grace() {
        let job = map("services:\n  a:\n    image: x\n    depends_on: [b]\n  b:\n    image: y\n");
        let a = &job.job.group("a").unwrap().tasks[0];
        assert_eq!(
            a.ordering,
            vec![OrderingHint::Registration {
                dependency: "b".to_string(),
                grace_seconds: Settings::default().registration_grace_seconds,
            }]
        );
    }

    #[test]
    fn test_build_only_service_gets_derived_image() {
        let job = map("services:\n  worker:\n    build: ./worker\n");
        let task = &job.job.groups[0].tasks[0];
        assert_eq!(task.config.image, "app-worker:latest");
        let build_warnings = job.warnings.iter().filter(|w| w.feature == "build").count();
        assert_eq!(build_warnings, 1);
    }
}
