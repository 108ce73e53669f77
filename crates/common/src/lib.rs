//! ModelPool common library
//!
//! Configuration, error taxonomy and metrics shared by the coordinator
//! and the reference worker.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::ModelPoolConfig;
pub use error::{ModelPoolError, Result};
pub use metrics::{MetricsRegistry, METRICS};
