//! HCL job specification writer
//!
//! Output follows `nomad fmt`: two-space indentation, `=` aligned across
//! runs of consecutive attributes, a blank line around nested blocks.
//! Groups are written in name order; within a group the primary task comes
//! first, the remaining tasks in name order, then one prestart gate task per
//! ordering hint. The same job always renders to the same bytes.

use crate::error::{NomadicError, Result};
use crate::mapper::NomadJob;
use crate::nomad::spec::{
    consul_service_name, gate_task_name, CheckSpec, GroupSpec, JobSpec, OrderingHint,
    ServiceSpec, TaskSpec, META_GATES, META_WAIT_CONDITION, META_WAIT_FOR, META_WAIT_GRACE,
};
use std::collections::{BTreeMap, BTreeSet};

const INDENT: &str = "  ";

/// Render a translated job as HCL
pub fn to_hcl(job: &NomadJob) -> Result<String> {
    render_job(&job.job)
}

/// Render a job specification as HCL
pub fn render_job(job: &JobSpec) -> Result<String> {
    check_invariants(job)?;

    let mut out = String::new();
    job_block(job).write(&mut out, 0);
    Ok(out)
}

/// Refuse jobs Nomad would reject outright
fn check_invariants(job: &JobSpec) -> Result<()> {
    let mut problems = Vec::new();
    let mut group_names = BTreeSet::new();

    for group in &job.groups {
        if !group_names.insert(group.name.as_str()) {
            problems.push(format!("duplicate group '{}'", group.name));
        }
        if group.tasks.is_empty() {
            problems.push(format!("group '{}' has no tasks", group.name));
        }

        let mut task_names = BTreeSet::new();
        for task in &group.tasks {
            let gates = task
                .ordering
                .iter()
                .map(|hint| gate_task_name(&task.name, hint.dependency()));
            for name in std::iter::once(task.name.clone()).chain(gates) {
                if !task_names.insert(name.clone()) {
                    problems.push(format!("duplicate task '{}' in group '{}'", name, group.name));
                }
            }

            for label in &task.config.ports {
                if group.port(label).is_none() {
                    problems.push(format!(
                        "task '{}' uses port '{}' not declared by group '{}'",
                        task.name, label, group.name
                    ));
                }
            }
        }

        for service in &group.services {
            if let Some(label) = &service.port {
                if group.port(label).is_none() {
                    problems.push(format!(
                        "service '{}' uses port '{}' not declared by group '{}'",
                        service.name, label, group.name
                    ));
                }
            }
            if let Some(task) = &service.task {
                if group.task(task).is_none() {
                    problems.push(format!(
                        "service '{}' belongs to unknown task '{}' in group '{}'",
                        service.name, task, group.name
                    ));
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(NomadicError::Emit(problems.join("; ")))
    }
}

/// Attribute value
#[derive(Debug, Clone)]
enum Expr {
    Str(String),
    Int(u64),
    Bool(bool),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl Expr {
    fn is_multiline(&self) -> bool {
        matches!(self, Expr::Map(m) if !m.is_empty())
    }

    fn write(&self, out: &mut String, depth: usize) {
        match self {
            Expr::Str(s) => out.push_str(&quote(s)),
            Expr::Int(n) => out.push_str(&n.to_string()),
            Expr::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Expr::List(items) => {
                let items: Vec<String> = items.iter().map(|s| quote(s)).collect();
                out.push('[');
                out.push_str(&items.join(", "));
                out.push(']');
            }
            Expr::Map(entries) if entries.is_empty() => out.push_str("{}"),
            Expr::Map(entries) => {
                let keys: Vec<String> = entries.keys().map(|k| quote(k)).collect();
                let width = keys.iter().map(String::len).max().unwrap_or(0);
                out.push_str("{\n");
                for (key, value) in keys.iter().zip(entries.values()) {
                    push_indent(out, depth + 1);
                    out.push_str(&format!("{:<width$} = {}\n", key, quote(value), width = width));
                }
                push_indent(out, depth);
                out.push('}');
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Item {
    Attr(String, Expr),
    Block(HclBlock),
}

impl Item {
    fn stands_alone(&self) -> bool {
        match self {
            Item::Attr(_, expr) => expr.is_multiline(),
            Item::Block(_) => true,
        }
    }
}

/// In-memory HCL block, written out in one pass
#[derive(Debug, Clone)]
struct HclBlock {
    kind: String,
    labels: Vec<String>,
    items: Vec<Item>,
}

impl HclBlock {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            labels: Vec::new(),
            items: Vec::new(),
        }
    }

    fn labeled(kind: &str, label: &str) -> Self {
        let mut block = Self::new(kind);
        block.labels.push(label.to_string());
        block
    }

    fn attr(&mut self, name: &str, value: Expr) -> &mut Self {
        self.items.push(Item::Attr(name.to_string(), value));
        self
    }

    fn string(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.attr(name, Expr::Str(value.into()))
    }

    fn opt_string(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            self.string(name, v);
        }
        self
    }

    fn list(&mut self, name: &str, values: &[String]) -> &mut Self {
        if !values.is_empty() {
            self.attr(name, Expr::List(values.to_vec()));
        }
        self
    }

    fn block(&mut self, block: HclBlock) -> &mut Self {
        self.items.push(Item::Block(block));
        self
    }

    /// `env { KEY = "v" }` when every key is an identifier, a map attribute otherwise
    fn string_map(&mut self, name: &str, map: &BTreeMap<String, String>) -> &mut Self {
        if map.is_empty() {
            return self;
        }
        if map.keys().all(|k| is_identifier(k)) {
            let mut block = HclBlock::new(name);
            for (k, v) in map {
                block.string(k, v.clone());
            }
            self.block(block)
        } else {
            self.attr(name, Expr::Map(map.clone()))
        }
    }

    fn write(&self, out: &mut String, depth: usize) {
        push_indent(out, depth);
        out.push_str(&self.kind);
        for label in &self.labels {
            out.push(' ');
            out.push_str(&quote(label));
        }

        if self.items.is_empty() {
            out.push_str(" {}\n");
            return;
        }
        out.push_str(" {\n");

        let mut i = 0;
        while i < self.items.len() {
            if i > 0 && (self.items[i].stands_alone() || self.items[i - 1].stands_alone()) {
                out.push('\n');
            }

            match &self.items[i] {
                Item::Block(block) => {
                    block.write(out, depth + 1);
                    i += 1;
                }
                Item::Attr(name, expr) if expr.is_multiline() => {
                    push_indent(out, depth + 1);
                    out.push_str(name);
                    out.push_str(" = ");
                    expr.write(out, depth + 1);
                    out.push('\n');
                    i += 1;
                }
                Item::Attr(..) => {
                    let end = self.items[i..]
                        .iter()
                        .position(Item::stands_alone)
                        .map(|p| i + p)
                        .unwrap_or(self.items.len());
                    let run = &self.items[i..end];
                    let width = run
                        .iter()
                        .filter_map(|item| match item {
                            Item::Attr(name, _) => Some(name.len()),
                            Item::Block(_) => None,
                        })
                        .max()
                        .unwrap_or(0);
                    for item in run {
                        if let Item::Attr(name, expr) = item {
                            push_indent(out, depth + 1);
                            out.push_str(&format!("{:<width$} = ", name, width = width));
                            expr.write(out, depth + 1);
                            out.push('\n');
                        }
                    }
                    i = end;
                }
            }
        }

        push_indent(out, depth);
        out.push_str("}\n");
    }
}

fn job_block(job: &JobSpec) -> HclBlock {
    let mut block = HclBlock::labeled("job", &job.name);
    block.list("datacenters", &job.datacenters);
    block.opt_string("region", job.region.as_deref());
    block.string("type", job.job_type.clone());

    let mut groups: Vec<&GroupSpec> = job.groups.iter().collect();
    groups.sort_by(|a, b| a.name.cmp(&b.name));
    for group in groups {
        block.block(group_block(job, group));
    }
    block
}

fn group_block(job: &JobSpec, group: &GroupSpec) -> HclBlock {
    let mut block = HclBlock::labeled("group", &group.name);
    block.attr("count", Expr::Int(group.count as u64));

    if let Some(network) = &group.network {
        let mut net = HclBlock::new("network");
        net.string("mode", network.mode.clone());
        for port in &network.ports {
            let mut p = HclBlock::labeled("port", &port.label);
            if let Some(s) = port.static_port {
                p.attr("static", Expr::Int(s as u64));
            }
            if let Some(to) = port.to {
                p.attr("to", Expr::Int(to as u64));
            }
            net.block(p);
        }
        block.block(net);
    }

    for volume in &group.volumes {
        let mut v = HclBlock::labeled("volume", &volume.name);
        v.string("type", volume.volume_type.clone())
            .string("source", volume.source.clone())
            .attr("read_only", Expr::Bool(volume.read_only));
        block.block(v);
    }

    for service in group.services.iter().filter(|s| s.task.is_none()) {
        block.block(service_block(service));
    }

    if let Some(restart) = &group.restart {
        block.block(restart_block(restart));
    }

    let mut tasks: Vec<&TaskSpec> = group.tasks.iter().collect();
    let primary = group
        .tasks
        .iter()
        .position(|t| t.name == group.name)
        .unwrap_or(0);
    let first = tasks.remove(primary);
    tasks.sort_by(|a, b| a.name.cmp(&b.name));
    tasks.insert(0, first);

    for task in &tasks {
        let services: Vec<&ServiceSpec> = group
            .services
            .iter()
            .filter(|s| s.task.as_deref() == Some(task.name.as_str()))
            .collect();
        block.block(task_block(task, &services));
    }
    for task in &tasks {
        for hint in &task.ordering {
            block.block(gate_block(job, task, hint));
        }
    }

    block
}

fn task_block(task: &TaskSpec, services: &[&ServiceSpec]) -> HclBlock {
    let mut block = HclBlock::labeled("task", &task.name);
    block.string("driver", task.driver.clone());
    block.opt_string("user", task.user.as_deref());

    let config = &task.config;
    let mut cfg = HclBlock::new("config");
    cfg.string("image", config.image.clone())
        .opt_string("command", config.command.as_deref())
        .list("args", &config.args)
        .list("entrypoint", &config.entrypoint)
        .opt_string("work_dir", config.work_dir.as_deref())
        .opt_string("network_mode", config.network_mode.as_deref())
        .list("ports", &config.ports)
        .list("volumes", &config.volumes);
    for mount in &config.mounts {
        let mut m = HclBlock::new("mount");
        m.string("type", mount.mount_type.clone())
            .string("source", mount.source.clone())
            .string("target", mount.target.clone())
            .attr("readonly", Expr::Bool(mount.readonly));
        cfg.block(m);
    }
    block.block(cfg);

    block.string_map("env", &task.env);
    block.string_map("meta", &task.meta);

    if let Some(resources) = &task.resources {
        let mut res = HclBlock::new("resources");
        if let Some(cpu) = resources.cpu {
            res.attr("cpu", Expr::Int(cpu as u64));
        }
        if let Some(memory) = resources.memory {
            res.attr("memory", Expr::Int(memory));
        }
        block.block(res);
    }

    for mount in &task.volume_mounts {
        let mut vm = HclBlock::new("volume_mount");
        vm.string("volume", mount.volume.clone())
            .string("destination", mount.destination.clone());
        if let Some(ro) = mount.read_only {
            vm.attr("read_only", Expr::Bool(ro));
        }
        block.block(vm);
    }

    for template in &task.templates {
        let mut tpl = HclBlock::new("template");
        tpl.string("data", template.data.clone())
            .string("destination", template.destination.clone())
            .string("change_mode", template.change_mode.clone());
        block.block(tpl);
    }

    if let Some(restart) = &task.restart {
        block.block(restart_block(restart));
    }

    if let Some(lifecycle) = &task.lifecycle {
        let mut lc = HclBlock::new("lifecycle");
        lc.string("hook", lifecycle.hook.clone())
            .attr("sidecar", Expr::Bool(lifecycle.sidecar));
        block.block(lc);
    }

    for service in services {
        block.block(service_block(service));
    }

    block
}

/// Prestart task that blocks until `hint`'s dependency resolves in Consul DNS
fn gate_block(job: &JobSpec, task: &TaskSpec, hint: &OrderingHint) -> HclBlock {
    let name = gate_task_name(&task.name, hint.dependency());
    let mut block = HclBlock::labeled("task", &name);
    block.string("driver", "docker");

    let mut script = format!(
        "until nslookup {}.service.consul >/dev/null 2>&1; do sleep {}; done",
        consul_service_name(hint.dependency()),
        job.gate.poll_seconds
    );
    if hint.grace_seconds() > 0 {
        script.push_str(&format!("; sleep {}", hint.grace_seconds()));
    }

    let mut cfg = HclBlock::new("config");
    cfg.string("image", job.gate.image.clone())
        .string("command", "sh")
        .list("args", &["-c".to_string(), script]);
    block.block(cfg);

    let mut meta = BTreeMap::new();
    meta.insert(META_GATES.to_string(), task.name.clone());
    meta.insert(META_WAIT_FOR.to_string(), hint.dependency().to_string());
    meta.insert(META_WAIT_CONDITION.to_string(), hint.condition().to_string());
    if !matches!(hint, OrderingHint::HealthGate { .. }) {
        meta.insert(META_WAIT_GRACE.to_string(), hint.grace_seconds().to_string());
    }
    block.string_map("meta", &meta);

    let mut resources = HclBlock::new("resources");
    resources
        .attr("cpu", Expr::Int(50))
        .attr("memory", Expr::Int(32));
    block.block(resources);

    let mut lc = HclBlock::new("lifecycle");
    lc.string("hook", "prestart")
        .attr("sidecar", Expr::Bool(false));
    block.block(lc);

    block
}

fn service_block(service: &ServiceSpec) -> HclBlock {
    let mut block = HclBlock::new("service");
    block
        .string("name", service.name.clone())
        .opt_string("port", service.port.as_deref())
        .string("provider", service.provider.clone())
        .list("tags", &service.tags);
    for check in &service.checks {
        block.block(check_block(check));
    }
    block
}

fn check_block(check: &CheckSpec) -> HclBlock {
    let mut block = HclBlock::new("check");
    block
        .string("type", check.check_type.clone())
        .opt_string("task", check.task.as_deref())
        .opt_string("command", check.command.as_deref())
        .list("args", &check.args)
        .opt_string("path", check.path.as_deref())
        .string("interval", duration(check.interval_ms))
        .string("timeout", duration(check.timeout_ms));

    if let Some(cr) = &check.check_restart {
        let mut restart = HclBlock::new("check_restart");
        restart
            .attr("limit", Expr::Int(cr.limit as u64))
            .string("grace", duration(cr.grace_ms));
        block.block(restart);
    }
    block
}

fn restart_block(restart: &crate::nomad::spec::RestartSpec) -> HclBlock {
    let mut block = HclBlock::new("restart");
    if let Some(attempts) = restart.attempts {
        block.attr("attempts", Expr::Int(attempts as u64));
    }
    block.string("mode", restart.mode.clone());
    block
}

/// `"30s"` for whole seconds, `"1500ms"` otherwise
pub fn duration(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

/// Quote a string so Nomad reads it back verbatim
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn push_indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nomad::spec::{NetworkSpec, PortSpec};
    use crate::nomad::NomadLoader;

    fn web_job() -> JobSpec {
        let mut job = JobSpec::new("shop");
        let mut group = GroupSpec::new("web");
        group.network = Some(NetworkSpec {
            mode: "bridge".to_string(),
            ports: vec![PortSpec {
                label: "web_80_8080".to_string(),
                static_port: Some(8080),
                to: Some(80),
            }],
        });
        let mut task = TaskSpec::new("web", "nginx:1.25");
        task.config.ports.push("web_80_8080".to_string());
        task.env.insert("MODE".to_string(), "prod".to_string());
        task.meta.insert("com.example.team".to_string(), "core".to_string());
        task.ordering.push(OrderingHint::HealthGate {
            dependency: "db".to_string(),
        });
        group.tasks.push(task);
        job.groups.push(group);
        job
    }

    #[test]
    fn test_quote_escapes_interpolation() {
        assert_eq!(quote("a\"b"), r#""a\"b""#);
        assert_eq!(quote("${HOME}"), r#""$${HOME}""#);
        assert_eq!(quote("%{ if }"), r#""%%{ if }""#);
        assert_eq!(quote("cost: $5"), r#""cost: $5""#);
        assert_eq!(quote("line\nnext"), r#""line\nnext""#);
    }

    #[test]
    fn test_duration_rendering() {
        assert_eq!(duration(30_000), "30s");
        assert_eq!(duration(1_500), "1500ms");
        assert_eq!(duration(0), "0s");
    }

    #[test]
    fn test_attributes_are_aligned() {
        let out = render_job(&web_job()).unwrap();
        assert!(out.contains("        static = 8080\n        to     = 80\n"));
        assert!(out.contains("      driver = \"docker\"\n"));
        assert!(out.contains("\"com.example.team\" = \"core\""));
        assert!(out.ends_with("}\n"));
    }

    #[test]
    fn test_gate_task_emitted_after_main_task() {
        let out = render_job(&web_job()).unwrap();
        let main = out.find("task \"web\"").unwrap();
        let gate = out.find("task \"web-await-db\"").unwrap();
        assert!(main < gate);
        assert!(out.contains("until nslookup db.service.consul"));
        assert!(out.contains("hook    = \"prestart\""));
    }

    #[test]
    fn test_output_loads_back() {
        let job = web_job();
        let out = render_job(&job).unwrap();
        let loaded = NomadLoader::new().parse_str(&out, "shop.nomad").unwrap();

        let group = loaded[0].group("web").unwrap();
        assert_eq!(group.tasks.len(), 1);
        let task = &group.tasks[0];
        assert_eq!(task.config.image, "nginx:1.25");
        assert_eq!(task.meta, job.groups[0].tasks[0].meta);
        assert_eq!(task.ordering, job.groups[0].tasks[0].ordering);
        assert_eq!(group.network, job.groups[0].network);
    }

    #[test]
    fn test_rendering_is_byte_identical() {
        let job = web_job();
        assert_eq!(render_job(&job).unwrap(), render_job(&job).unwrap());
    }

    #[test]
    fn test_invariant_breaches_are_emit_errors() {
        let mut job = web_job();
        job.groups[0].tasks[0].config.ports.push("missing".to_string());
        job.groups.push(GroupSpec::new("empty"));

        match render_job(&job).unwrap_err() {
            NomadicError::Emit(message) => {
                assert!(message.contains("port 'missing'"));
                assert!(message.contains("group 'empty' has no tasks"));
            }
            other => panic!("expected emit error, got {:?}", other),
        }
    }

    #[test]
    fn test_gate_name_collision_is_detected() {
        let mut job = web_job();
        job.groups[0]
            .tasks
            .push(TaskSpec::new("web-await-db", "busybox"));
        let err = render_job(&job).unwrap_err();
        assert!(err.to_string().contains("duplicate task 'web-await-db'"));
    }
}
