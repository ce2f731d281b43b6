//! berth-core — shared types for the berth placement scheduler.
//!
//! Holds the cluster snapshot records exchanged with the inventory
//! collaborator, the workload request, and the [`PolicyDefaults`] that
//! tune the allocation pipeline.

pub mod config;
pub mod error;
pub mod lenient;
pub mod types;

pub use config::PolicyDefaults;
pub use error::{ConfigError, ConfigResult};
pub use lenient::Lenient;
pub use types::*;
