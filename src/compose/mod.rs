//! Docker Compose input
//!
//! Raw document types and the loader that resolves includes, interpolation
//! and merging into one [`ComposeFile`].

pub mod config;
pub mod loader;

pub use config::{ComposeFile, ServiceConfig};
pub use loader::ComposeLoader;
