//! Configuration loading and parsing.
//!
//! A single YAML file (`tardy.yaml`) configures the HTTP server, the
//! dispatcher, the retry policy, the storage backend, the demo services and
//! the recurring schedules registered at startup.

mod error;
mod types;
mod yaml;

pub use error::ConfigError;
pub use types::{DispatcherSettings, GlobalConfig, RecurringConfig, StorageConfig};
pub use yaml::YamlLoader;
