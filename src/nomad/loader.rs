//! Nomad job file loader
//!
//! Parses HCL job specifications into [`JobSpec`] values. Dependency gate
//! tasks are folded back into [`OrderingHint`]s on the tasks they guard.

use super::parser::{self, Block, Body, Value};
use super::spec::{
    CheckRestartSpec, CheckSpec, DockerConfig, DockerMount, GroupSpec, HostVolumeSpec, JobSpec,
    LifecycleSpec, NetworkSpec, OrderingHint, PortSpec, ResourcesSpec, RestartSpec, ServiceSpec,
    TaskSpec, TemplateSpec, VolumeMountSpec, META_GATES, META_WAIT_CONDITION, META_WAIT_FOR,
    META_WAIT_GRACE,
};
use crate::error::{NomadicError, Result};
use crate::model::builder::parse_duration_ms;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File extensions picked up when a directory is given
pub const JOB_FILE_EXTENSIONS: &[&str] = &["nomad", "hcl"];

/// Nomad job loader
#[derive(Debug, Clone, Default)]
pub struct NomadLoader;

impl NomadLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load every job from several files or directories, in order
    pub fn load_paths(&self, paths: &[&Path]) -> Result<Vec<JobSpec>> {
        let mut jobs = Vec::new();
        for path in paths {
            jobs.extend(self.load_path(path)?);
        }
        Ok(jobs)
    }

    /// Load a job file, or every job file below a directory
    pub fn load_path(&self, path: &Path) -> Result<Vec<JobSpec>> {
        if !path.exists() {
            return Err(NomadicError::Reference(vec![format!(
                "{}: no such file or directory",
                path.display()
            )]));
        }

        if !path.is_dir() {
            return self.load_file(path);
        }

        let mut jobs = Vec::new();
        for file in find_job_files(path) {
            jobs.extend(self.load_file(&file)?);
        }
        if jobs.is_empty() {
            tracing::warn!("No Nomad job files found under {}", path.display());
        }
        Ok(jobs)
    }

    /// Load every job declared in one file
    pub fn load_file(&self, path: &Path) -> Result<Vec<JobSpec>> {
        tracing::debug!("Loading Nomad job file {}", path.display());
        let content = std::fs::read_to_string(path)?;
        self.parse_str(&content, &path.display().to_string())
    }

    /// Parse job specification text
    pub fn parse_str(&self, content: &str, source_name: &str) -> Result<Vec<JobSpec>> {
        let body = parser::parse(content, source_name)?;
        let decoder = Decoder { source_name };

        let mut jobs = Vec::new();
        for block in &body.blocks {
            match block.kind.as_str() {
                "job" => jobs.push(decoder.job(block)?),
                other => tracing::debug!(
                    "{}: ignoring top-level '{}' block at line {}",
                    source_name,
                    other,
                    block.line
                ),
            }
        }
        Ok(jobs)
    }
}

/// Job files below `dir`, sorted by path
pub fn find_job_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| JOB_FILE_EXTENSIONS.contains(&e))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

struct Decoder<'a> {
    source_name: &'a str,
}

impl<'a> Decoder<'a> {
    fn error(&self, line: usize, message: impl std::fmt::Display) -> NomadicError {
        NomadicError::parse(self.source_name, format!("line {}: {}", line, message))
    }

    fn required_label<'b>(&self, block: &'b Block) -> Result<&'b str> {
        block
            .label()
            .ok_or_else(|| self.error(block.line, format!("{} block requires a name", block.kind)))
    }

    fn duration(&self, body: &Body, name: &str, line: usize) -> Result<Option<u64>> {
        match body.attr(name) {
            None => Ok(None),
            Some(Value::Number(n)) if *n >= 0.0 => Ok(Some((*n * 1000.0) as u64)),
            Some(Value::String(s)) => parse_duration_ms(s)
                .map(Some)
                .ok_or_else(|| self.error(line, format!("invalid duration '{}' for {}", s, name))),
            Some(other) => Err(self.error(line, format!("invalid duration {:?} for {}", other, name))),
        }
    }

    fn number<T: TryFrom<u64>>(&self, body: &Body, name: &str, line: usize) -> Result<Option<T>> {
        match body.attr(name) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|n| T::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| self.error(line, format!("{} must be a non-negative integer", name))),
        }
    }

    fn job(&self, block: &Block) -> Result<JobSpec> {
        let name = self.required_label(block)?;
        let body = &block.body;
        let mut job = JobSpec::new(name);

        if let Some(t) = body.string("type") {
            job.job_type = t.to_string();
        }
        job.region = body.string("region").map(String::from);
        if let Some(dcs) = body.attr("datacenters") {
            job.datacenters = string_list(dcs);
        }

        for group in body.blocks("group") {
            job.groups.push(self.group(group)?);
        }

        // Tasks declared directly under a job form an implicit group of the same name
        let loose: Vec<&Block> = body.blocks("task").collect();
        if !loose.is_empty() {
            let mut group = GroupSpec::new(name);
            for task in loose {
                group.tasks.push(self.task(task, &mut group.services)?);
            }
            job.groups.push(group);
        }

        Ok(job)
    }

    fn group(&self, block: &Block) -> Result<GroupSpec> {
        let name = self.required_label(block)?;
        let body = &block.body;
        let mut group = GroupSpec::new(name);

        if let Some(count) = self.number(body, "count", block.line)? {
            group.count = count;
        }

        if let Some(net) = body.block("network") {
            group.network = Some(self.network(net)?);
        }

        for vol in body.blocks("volume") {
            let label = self.required_label(vol)?;
            group.volumes.push(HostVolumeSpec {
                name: label.to_string(),
                volume_type: vol.body.string("type").unwrap_or("host").to_string(),
                source: vol.body.string("source").unwrap_or(label).to_string(),
                read_only: vol.body.attr("read_only").and_then(Value::as_bool).unwrap_or(false),
            });
        }

        for svc in body.blocks("service") {
            group.services.push(self.service(svc, None)?);
        }

        if let Some(restart) = body.block("restart") {
            group.restart = Some(self.restart(restart)?);
        }

        let mut tasks = Vec::new();
        for task in body.blocks("task") {
            tasks.push(self.task(task, &mut group.services)?);
        }

        let (gates, mut mains): (Vec<TaskSpec>, Vec<TaskSpec>) =
            tasks.into_iter().partition(TaskSpec::is_gate);

        for gate in gates {
            fold_gate(name, gate, &mut mains);
        }
        group.tasks = mains;

        Ok(group)
    }

    fn network(&self, block: &Block) -> Result<NetworkSpec> {
        let mut network = NetworkSpec {
            mode: block.body.string("mode").unwrap_or("host").to_string(),
            ports: Vec::new(),
        };

        for port in block.body.blocks("port") {
            let label = self.required_label(port)?;
            network.ports.push(PortSpec {
                label: label.to_string(),
                static_port: self.number(&port.body, "static", port.line)?,
                to: self.number(&port.body, "to", port.line)?,
            });
        }

        Ok(network)
    }

    fn service(&self, block: &Block, task: Option<&str>) -> Result<ServiceSpec> {
        let body = &block.body;
        let name = body
            .string("name")
            .map(String::from)
            .or_else(|| task.map(String::from))
            .ok_or_else(|| self.error(block.line, "group service requires a name"))?;

        let mut service = ServiceSpec {
            name,
            port: body.attr("port").and_then(Value::to_text),
            provider: body.string("provider").unwrap_or("consul").to_string(),
            tags: body.attr("tags").map(string_list).unwrap_or_default(),
            task: task.map(String::from),
            checks: Vec::new(),
        };

        for check in body.blocks("check") {
            service.checks.push(self.check(check)?);
        }

        Ok(service)
    }

    fn check(&self, block: &Block) -> Result<CheckSpec> {
        let body = &block.body;
        let check_restart = match body.block("check_restart") {
            Some(cr) => Some(CheckRestartSpec {
                limit: self.number(&cr.body, "limit", cr.line)?.unwrap_or(0),
                grace_ms: self.duration(&cr.body, "grace", cr.line)?.unwrap_or(0),
            }),
            None => None,
        };

        Ok(CheckSpec {
            check_type: body.string("type").unwrap_or("script").to_string(),
            task: body.string("task").map(String::from),
            command: body.string("command").map(String::from),
            args: body.attr("args").map(string_list).unwrap_or_default(),
            path: body.string("path").map(String::from),
            interval_ms: self.duration(body, "interval", block.line)?.unwrap_or(0),
            timeout_ms: self.duration(body, "timeout", block.line)?.unwrap_or(0),
            check_restart,
        })
    }

    fn restart(&self, block: &Block) -> Result<RestartSpec> {
        Ok(RestartSpec {
            attempts: self.number(&block.body, "attempts", block.line)?,
            mode: block.body.string("mode").unwrap_or("fail").to_string(),
        })
    }

    fn task(&self, block: &Block, group_services: &mut Vec<ServiceSpec>) -> Result<TaskSpec> {
        let name = self.required_label(block)?;
        let body = &block.body;

        let driver = body
            .string("driver")
            .ok_or_else(|| self.error(block.line, format!("task '{}' has no driver", name)))?;

        let mut task = TaskSpec::new(name, "");
        task.driver = driver.to_string();

        if let Some(config) = body.block("config") {
            task.config = self.docker_config(config)?;
        }

        task.env = self.string_map(body, "env");
        task.meta = self.string_map(body, "meta");
        task.user = body.string("user").map(String::from);

        if let Some(res) = body.block("resources") {
            task.resources = Some(ResourcesSpec {
                cpu: self.number(&res.body, "cpu", res.line)?,
                memory: self.number(&res.body, "memory", res.line)?,
            });
        }

        for vm in body.blocks("volume_mount") {
            let volume = vm
                .body
                .string("volume")
                .ok_or_else(|| self.error(vm.line, "volume_mount requires a volume"))?;
            let destination = vm
                .body
                .string("destination")
                .ok_or_else(|| self.error(vm.line, "volume_mount requires a destination"))?;
            task.volume_mounts.push(VolumeMountSpec {
                volume: volume.to_string(),
                destination: destination.to_string(),
                read_only: vm.body.attr("read_only").and_then(Value::as_bool),
            });
        }

        for tpl in body.blocks("template") {
            task.templates.push(TemplateSpec {
                data: tpl.body.string("data").unwrap_or_default().to_string(),
                destination: tpl
                    .body
                    .string("destination")
                    .ok_or_else(|| self.error(tpl.line, "template requires a destination"))?
                    .to_string(),
                change_mode: tpl.body.string("change_mode").unwrap_or("restart").to_string(),
            });
        }

        if let Some(restart) = body.block("restart") {
            task.restart = Some(self.restart(restart)?);
        }

        if let Some(lifecycle) = body.block("lifecycle") {
            task.lifecycle = Some(LifecycleSpec {
                hook: lifecycle.body.string("hook").unwrap_or("prestart").to_string(),
                sidecar: lifecycle
                    .body
                    .attr("sidecar")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }

        for svc in body.blocks("service") {
            group_services.push(self.service(svc, Some(name))?);
        }

        Ok(task)
    }

    fn docker_config(&self, block: &Block) -> Result<DockerConfig> {
        let body = &block.body;
        let mut config = DockerConfig {
            image: body.attr("image").and_then(Value::to_text).unwrap_or_default(),
            command: body.string("command").map(String::from),
            args: body.attr("args").map(string_list).unwrap_or_default(),
            entrypoint: body.attr("entrypoint").map(string_list).unwrap_or_default(),
            work_dir: body.string("work_dir").map(String::from),
            network_mode: body.string("network_mode").map(String::from),
            ports: body.attr("ports").map(string_list).unwrap_or_default(),
            volumes: body.attr("volumes").map(string_list).unwrap_or_default(),
            mounts: Vec::new(),
        };

        for mount in body.blocks("mount") {
            let target = mount
                .body
                .string("target")
                .ok_or_else(|| self.error(mount.line, "mount requires a target"))?;
            config.mounts.push(DockerMount {
                mount_type: mount.body.string("type").unwrap_or("volume").to_string(),
                source: mount.body.string("source").unwrap_or_default().to_string(),
                target: target.to_string(),
                readonly: mount
                    .body
                    .attr("readonly")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }

        Ok(config)
    }

    /// `name { k = v }` block or `name = { k = v }` attribute
    fn string_map(&self, body: &Body, name: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(block) = body.block(name) {
            for attr in &block.body.attributes {
                if let Some(v) = attr.value.to_text() {
                    map.insert(attr.name.clone(), v);
                }
            }
        }
        if let Some(entries) = body.attr(name).and_then(Value::as_object) {
            for (k, v) in entries {
                if let Some(v) = v.to_text() {
                    map.insert(k.clone(), v);
                }
            }
        }
        map
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::List(items) => items.iter().filter_map(Value::to_text).collect(),
        other => other.to_text().into_iter().collect(),
    }
}

/// Turn a gate task back into an ordering hint on the task it guards
fn fold_gate(group: &str, gate: TaskSpec, mains: &mut [TaskSpec]) {
    let Some(dependency) = gate.meta.get(META_WAIT_FOR).cloned() else {
        return;
    };
    let condition = gate
        .meta
        .get(META_WAIT_CONDITION)
        .map(String::as_str)
        .unwrap_or("healthy");
    let grace = gate
        .meta
        .get(META_WAIT_GRACE)
        .and_then(|g| g.parse().ok())
        .unwrap_or(0);

    let hint = OrderingHint::from_condition(condition, dependency.clone(), grace)
        .unwrap_or(OrderingHint::HealthGate { dependency });

    let target = gate.meta.get(META_GATES).cloned();
    let index = target
        .as_deref()
        .and_then(|t| mains.iter().position(|m| m.name == t))
        .or(if mains.is_empty() { None } else { Some(0) });

    match index {
        Some(i) => mains[i].ordering.push(hint),
        None => tracing::warn!(
            "Group '{}': gate task '{}' has no task to guard, dropping it",
            group,
            gate.name
        ),
    }
}
