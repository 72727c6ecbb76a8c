//! Notification demo handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::FailureInjector;
use crate::core::handler::{HandlerOutcome, JobContext, JobHandler};

/// Arguments of a notification job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationArgs {
    pub user: String,
}

impl NotificationArgs {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

/// Sends a (simulated) notification to a user.
pub struct NotificationHandler {
    injector: Arc<dyn FailureInjector>,
    delay: Duration,
}

impl NotificationHandler {
    pub fn new(injector: Arc<dyn FailureInjector>) -> Self {
        Self {
            injector,
            delay: Duration::from_millis(500),
        }
    }

    /// Builder: set the simulated sending time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
        let args: NotificationArgs = match ctx.args() {
            Ok(args) => args,
            Err(e) => return HandlerOutcome::fatal(format!("invalid notification arguments: {}", e)),
        };

        tracing::info!(
            job_id = %ctx.job_id,
            user = %args.user,
            attempt = ctx.attempt,
            max_attempts = ctx.max_attempts,
            "Sending notification"
        );

        if self.injector.should_fail(&ctx) {
            tracing::warn!(
                job_id = %ctx.job_id,
                user = %args.user,
                attempt = ctx.attempt,
                "Simulated failure: notification service unreachable"
            );
            return HandlerOutcome::retry(format!(
                "simulated failure on attempt {}: could not reach the notification service for {}",
                ctx.attempt, args.user
            ));
        }

        tokio::time::sleep(self.delay).await;

        tracing::info!(
            job_id = %ctx.job_id,
            user = %args.user,
            message = %format!("Hello {}, this is your notification", args.user),
            "Notification sent"
        );
        HandlerOutcome::Success
    }
}
