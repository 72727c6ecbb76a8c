//! Job handlers and the registry that maps payload names to them.
//!
//! A handler receives a [`JobContext`] describing the attempt and returns an
//! explicit [`HandlerOutcome`]. Handlers never signal retries by panicking;
//! a panic is still caught by the dispatcher and treated as retryable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::job::Job;
use super::types::JobId;

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The work is done.
    Success,
    /// Failed, but trying again may help.
    Retryable(String),
    /// Failed in a way retries cannot fix.
    Fatal(String),
}

impl HandlerOutcome {
    /// A retryable failure from any displayable error.
    pub fn retry(error: impl fmt::Display) -> Self {
        Self::Retryable(error.to_string())
    }

    /// A fatal failure from any displayable error.
    pub fn fatal(error: impl fmt::Display) -> Self {
        Self::Fatal(error.to_string())
    }
}

/// Why an attempt did not succeed. The `Display` text is stored as the
/// job's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    /// The handler reported a retryable failure.
    #[error("{0}")]
    Handler(String),

    /// The handler did not finish in time.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler task panicked.
    #[error("handler panicked")]
    Panicked,

    /// No handler is registered under the payload's name.
    #[error("no handler registered for '{0}'")]
    UnknownHandler(String),

    /// The handler reported a fatal failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExecutionFailure {
    /// Whether the retry policy gets a say.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionFailure::Handler(_) | ExecutionFailure::Timeout(_) | ExecutionFailure::Panicked
        )
    }
}

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub handler: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    args: serde_json::Value,
}

impl JobContext {
    /// Build the context for the current attempt of `job`.
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            handler: job.payload.handler.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            scheduled_at: job.scheduled_at,
            args: job.payload.args.clone(),
        }
    }

    /// Raw JSON arguments.
    pub fn raw_args(&self) -> &serde_json::Value {
        &self.args
    }

    /// Deserialize the arguments.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }

    /// Whether this is the last attempt the job will get.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A unit of background work.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use tardy::{HandlerOutcome, JobContext, JobHandler};
///
/// struct Greet;
///
/// #[async_trait]
/// impl JobHandler for Greet {
///     async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
///         match ctx.args::<String>() {
///             Ok(name) => {
///                 tracing::info!(%name, "hello");
///                 HandlerOutcome::Success
///             }
///             Err(e) => HandlerOutcome::fatal(e),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt.
    async fn handle(&self, ctx: JobContext) -> HandlerOutcome;
}

/// Maps payload handler names to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register(name, handler);
        self
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
