//! Stage wiring for `convert`, `diff` and `check`

use crate::compose::ComposeLoader;
use crate::config::Settings;
use crate::emit::{self, OutputFormat};
use crate::error::Result;
use crate::mapper::{Mapper, NomadJob};
use crate::model::{ModelBuilder, ProfileSelection, ServiceGraph, SourceKind};
use crate::nomad::loader::{find_job_files, JOB_FILE_EXTENSIONS};
use crate::nomad::NomadLoader;
use crate::reconcile::{Analyzer, SyncReport};
use std::collections::BTreeMap;
use std::path::Path;

/// Loads, translates and compares deployments under one set of settings
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    settings: Settings,
    /// Compose interpolation variables; override `.env`
    env: BTreeMap<String, String>,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            env: BTreeMap::new(),
        }
    }

    /// Interpolate Compose files with these variables (typically the process environment)
    pub fn with_env<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    fn compose_loader(&self) -> ComposeLoader {
        ComposeLoader::new().with_env(self.env.clone())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn builder(&self) -> ModelBuilder {
        ModelBuilder::new(&self.settings)
    }

    /// Load a Compose file, or the default compose file of a directory
    pub fn compose_graph(&self, path: &Path) -> Result<ServiceGraph> {
        let doc = self.compose_loader().load_path(path)?;
        self.builder().from_compose(&doc, &fallback_name(path))
    }

    /// Build a Compose graph from in-memory text
    pub fn compose_graph_str(
        &self,
        content: &str,
        source_name: &str,
        base_dir: &Path,
    ) -> Result<ServiceGraph> {
        let doc = self.compose_loader().parse_str(content, source_name, base_dir)?;
        self.builder().from_compose(&doc, &fallback_name(base_dir))
    }

    /// Load every job from the given files or directories as one graph
    pub fn nomad_graph(&self, paths: &[&Path]) -> Result<ServiceGraph> {
        let jobs = NomadLoader::new().load_paths(paths)?;
        self.builder().from_nomad(&jobs)
    }

    pub fn nomad_graph_str(&self, content: &str, source_name: &str) -> Result<ServiceGraph> {
        let jobs = NomadLoader::new().parse_str(content, source_name)?;
        self.builder().from_nomad(&jobs)
    }

    /// Load either kind of input, telling them apart by file extension
    pub fn load_graph(&self, path: &Path) -> Result<ServiceGraph> {
        if is_nomad_input(path) {
            self.nomad_graph(&[path])
        } else {
            self.compose_graph(path)
        }
    }

    /// Translate a graph into one Nomad job named `job_name` or after the graph
    pub fn convert(
        &self,
        graph: &ServiceGraph,
        selection: &ProfileSelection,
        job_name: Option<&str>,
    ) -> NomadJob {
        let name = job_name.unwrap_or(&graph.name);
        Mapper::new(&self.settings).map(graph, selection, name)
    }

    pub fn render(&self, job: &NomadJob, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Hcl => emit::to_hcl(job),
            OutputFormat::Json => emit::to_json(job),
        }
    }

    /// Compare two deployments
    ///
    /// Profiles only filter the Compose side; Nomad graphs have none, and
    /// their scaled-to-zero groups are always excluded.
    pub fn diff(&self, a: &ServiceGraph, b: &ServiceGraph, selection: &ProfileSelection) -> SyncReport {
        let side = |graph: &ServiceGraph| match graph.kind {
            SourceKind::Compose => selection.clone(),
            SourceKind::Nomad => ProfileSelection::all(),
        };
        let (sel_a, sel_b) = (side(a), side(b));
        Analyzer::new(&self.settings).analyze(&a.active_set(&sel_a), &b.active_set(&sel_b))
    }
}

/// Directories holding job files, and `.nomad`/`.hcl` files, are Nomad input
pub fn is_nomad_input(path: &Path) -> bool {
    if path.is_dir() {
        return ComposeLoader::find_compose_file(path).is_none() && !find_job_files(path).is_empty();
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| JOB_FILE_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

fn fallback_name(path: &Path) -> String {
    let dir = if path.is_dir() { Some(path) } else { path.parent() };
    dir.and_then(|d| d.file_name())
        .and_then(|n| n.to_str())
        .map(str::to_lowercase)
        .unwrap_or_else(|| "compose".to_string())
}
