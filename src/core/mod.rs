//! Core job engine types: identifiers, jobs, cron schedules, retry policy,
//! handlers and the clock.

pub mod clock;
pub mod handler;
pub mod job;
pub mod retry;
pub mod schedule;
pub mod types;
