//! nomadic - Docker Compose to Nomad translator
//!
//! This is the CLI entry point. Results go to stdout (or `--output`),
//! diagnostics go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use nomadic::config::{ProfileEmission, Settings};
use nomadic::emit::OutputFormat;
use nomadic::model::{ProfileSelection, SourceKind};
use nomadic::reconcile::{report, ReportFormat};
use nomadic::Pipeline;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// nomadic - Compose to Nomad translator and drift analyzer
#[derive(Parser)]
#[command(name = "nomadic")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Translate Docker Compose projects into Nomad jobs and report drift", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Settings file (default: <config dir>/nomadic/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a Compose project into a Nomad job
    Convert {
        /// Compose file or project directory
        input: PathBuf,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Hcl)]
        format: OutputFormat,
        /// Enable a profile (repeatable, '*' for all)
        #[arg(short, long = "profile")]
        profiles: Vec<String>,
        /// How services outside the enabled profiles are emitted (omit, scale-to-zero)
        #[arg(long)]
        profiles_mode: Option<ProfileEmission>,
        /// Job name (default: the project name)
        #[arg(short, long)]
        job: Option<String>,
        /// Datacenter (repeatable)
        #[arg(long = "datacenter")]
        datacenters: Vec<String>,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Report drift between a Compose project and Nomad jobs
    Diff {
        /// Compose file or project directory
        compose: PathBuf,
        /// Nomad job file or directory of job files
        nomad: PathBuf,
        /// Enable a Compose profile (repeatable, '*' for all)
        #[arg(short, long = "profile")]
        profiles: Vec<String>,
        /// Report format
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,
        /// Name similarity threshold for rename detection (0 to 1)
        #[arg(short, long)]
        threshold: Option<f64>,
    },

    /// Validate a Compose project or Nomad jobs and print the canonical model
    Check {
        /// Compose file, job file, or directory
        input: PathBuf,
        /// Enable a Compose profile (repeatable, '*' for all)
        #[arg(short, long = "profile")]
        profiles: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries job specs and reports
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Commands::Convert {
            input,
            format,
            profiles,
            profiles_mode,
            job,
            datacenters,
            output,
        } => {
            if let Some(mode) = profiles_mode {
                settings.profile_emission = mode;
            }
            if !datacenters.is_empty() {
                settings.datacenters = datacenters;
            }

            let pipeline = Pipeline::new(settings).with_env(std::env::vars());
            let graph = pipeline
                .compose_graph(&input)
                .with_context(|| format!("Failed to load {}", input.display()))?;
            let translated = pipeline.convert(&graph, &ProfileSelection::new(profiles), job.as_deref());

            for warning in &translated.warnings {
                tracing::warn!("{}", warning);
            }

            let rendered = pipeline.render(&translated, format)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!(
                        "Wrote job '{}' ({} group(s)) to {}",
                        translated.job.name,
                        translated.job.groups.len(),
                        path.display()
                    );
                }
                None => print!("{}", rendered),
            }
        }

        Commands::Diff {
            compose,
            nomad,
            profiles,
            format,
            threshold,
        } => {
            if let Some(t) = threshold {
                settings.similarity_threshold = t;
                settings.validate()?;
            }

            let pipeline = Pipeline::new(settings).with_env(std::env::vars());
            let a = pipeline
                .compose_graph(&compose)
                .with_context(|| format!("Failed to load {}", compose.display()))?;
            let b = pipeline
                .nomad_graph(&[nomad.as_path()])
                .with_context(|| format!("Failed to load {}", nomad.display()))?;

            let sync = pipeline.diff(&a, &b, &ProfileSelection::new(profiles));
            print!("{}", report::render(&sync, format)?);
        }

        Commands::Check { input, profiles } => {
            let pipeline = Pipeline::new(settings).with_env(std::env::vars());
            let graph = pipeline
                .load_graph(&input)
                .with_context(|| format!("Failed to load {}", input.display()))?;

            let selection = ProfileSelection::new(profiles);
            let active = graph.active_set(&selection);
            tracing::info!(
                "{} '{}': {} service(s), {} active",
                graph.kind,
                graph.name,
                graph.len(),
                active.len()
            );

            if graph.kind == SourceKind::Compose {
                for warning in pipeline.convert(&graph, &selection, None).warnings {
                    tracing::warn!("{}", warning);
                }
            }

            let yaml = serde_yaml::to_string(&graph).context("Failed to serialize model")?;
            print!("{}", yaml);
        }
    }

    Ok(())
}
