//! Serialisation of translated jobs
//!
//! [`hcl`] writes job specifications in `nomad fmt` layout; [`json`] dumps
//! the translation result as-is.

pub mod hcl;
pub mod json;

pub use hcl::to_hcl;
pub use json::to_json;

/// Output format of `convert`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Hcl,
    Json,
}
