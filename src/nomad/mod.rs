//! Nomad job specifications
//!
//! A hand-written HCL lexer and parser, the job types shared by the loader,
//! the mapper and the emitter, and the loader itself.

pub mod lexer;
pub mod loader;
pub mod parser;
pub mod spec;

pub use loader::NomadLoader;
pub use spec::{GroupSpec, JobSpec, OrderingHint, TaskSpec};
