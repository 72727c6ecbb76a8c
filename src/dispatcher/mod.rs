//! Dispatcher and worker pool.
//!
//! This module provides the polling workers that claim and execute due jobs,
//! and the coordinator that fires recurring schedules, reclaims expired
//! leases and purges old jobs.

mod engine;
mod handle;
mod types;
mod worker;

pub use engine::Dispatcher;
pub use handle::DispatcherHandle;
pub use types::{DispatcherConfig, DispatcherError, DispatcherState, MaintenanceReport};
