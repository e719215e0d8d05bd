//! nomadic - Docker Compose to Nomad translation and drift analysis
//!
//! nomadic reads Docker Compose projects and HashiCorp Nomad job
//! specifications into one canonical service model. From there it can:
//!
//! - Translate a Compose project into a Nomad job (HCL or JSON)
//! - Report drift between a Compose project and a set of Nomad jobs
//! - Validate either input and show its canonical form

pub mod compose;
pub mod config;
pub mod emit;
pub mod error;
pub mod mapper;
pub mod model;
pub mod nomad;
pub mod pipeline;
pub mod reconcile;

pub use error::{NomadicError, Result};
pub use pipeline::Pipeline;
