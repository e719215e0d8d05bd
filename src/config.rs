//! Tool settings
//!
//! Settings are read from an explicit YAML file, or from
//! `<config_dir>/nomadic/config.yaml` when it exists, and fall back to
//! built-in defaults otherwise. Command-line flags override individual
//! fields after loading.

use crate::error::{NomadicError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default similarity above which two unmatched names are flagged as a
/// probable rename
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.70;

/// MHz granted per whole CPU when converting Compose `cpus`
pub const DEFAULT_CPU_MHZ_PER_CORE: u32 = 1000;

/// How services excluded by profiles are emitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileEmission {
    /// Inactive services do not appear in the job at all
    #[default]
    Omit,
    /// Inactive services are emitted in groups with `count = 0`
    ScaleToZero,
}

impl std::str::FromStr for ProfileEmission {
    type Err = NomadicError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "omit" => Ok(Self::Omit),
            "scale-to-zero" => Ok(Self::ScaleToZero),
            other => Err(NomadicError::InvalidConfig(format!(
                "unknown profile emission mode '{}' (expected omit or scale-to-zero)",
                other
            ))),
        }
    }
}

/// Settings shared by conversion and reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name similarity threshold for naming-mismatch detection
    pub similarity_threshold: f64,
    /// CPU conversion constant
    pub cpu_mhz_per_core: u32,
    /// Profile emission mode
    pub profile_emission: ProfileEmission,
    /// Datacenters written into emitted jobs
    pub datacenters: Vec<String>,
    /// Optional region
    pub region: Option<String>,
    /// Nomad job type
    pub job_type: String,
    /// Image used by dependency gate tasks
    pub await_image: String,
    /// Poll interval of dependency gate tasks
    pub await_poll_seconds: u32,
    /// Extra wait after a dependency without health check registers
    pub registration_grace_seconds: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            cpu_mhz_per_core: DEFAULT_CPU_MHZ_PER_CORE,
            profile_emission: ProfileEmission::default(),
            datacenters: vec!["dc1".to_string()],
            region: None,
            job_type: "service".to_string(),
            await_image: "busybox:1.36".to_string(),
            await_poll_seconds: 2,
            registration_grace_seconds: 5,
        }
    }
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("nomadic").join("config.yaml"))
    }

    /// Load settings from an explicit path, the default location, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => {
                    tracing::debug!("Loading settings from {}", p.display());
                    Self::from_file(&p)?
                }
                _ => Self::default(),
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse settings from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)
            .map_err(|e| NomadicError::Yaml(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would make conversion or analysis meaningless
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(NomadicError::InvalidConfig(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.cpu_mhz_per_core == 0 {
            return Err(NomadicError::InvalidConfig(
                "cpu_mhz_per_core must be greater than zero".to_string(),
            ));
        }
        if self.datacenters.is_empty() {
            return Err(NomadicError::InvalidConfig(
                "at least one datacenter is required".to_string(),
            ));
        }
        if self.await_poll_seconds == 0 {
            return Err(NomadicError::InvalidConfig(
                "await_poll_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
