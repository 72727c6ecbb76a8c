//! Dispatcher handle for controlling a running dispatcher.
//!
//! This module provides the `DispatcherHandle` type that allows external
//! control of the dispatcher through pause, resume, maintain and shutdown.

use tokio::sync::{mpsc, oneshot, watch};

use super::types::{DispatcherCommand, DispatcherError, DispatcherState, MaintenanceReport};

/// Buffer size for the command channel between DispatcherHandle and Dispatcher.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    pub(crate) command_tx: mpsc::Sender<DispatcherCommand>,
    pub(crate) state: watch::Receiver<DispatcherState>,
}

impl DispatcherHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, DispatcherError>>) -> DispatcherCommand,
        operation: &str,
    ) -> Result<T, DispatcherError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                DispatcherError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            DispatcherError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> DispatcherCommand,
        operation: &str,
    ) -> Result<(), DispatcherError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                DispatcherError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            DispatcherError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    /// Pause the dispatcher.
    ///
    /// While paused, workers claim no new jobs and recurring schedules do not
    /// fire. Jobs already running finish normally.
    pub async fn pause(&self) -> Result<(), DispatcherError> {
        self.send_unit_command(|response| DispatcherCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the dispatcher after being paused.
    pub async fn resume(&self) -> Result<(), DispatcherError> {
        self.send_unit_command(|response| DispatcherCommand::Resume { response }, "resume")
            .await
    }

    /// Run one maintenance pass now instead of waiting for the next tick.
    pub async fn maintain(&self) -> Result<MaintenanceReport, DispatcherError> {
        self.send_result_command(
            |response| DispatcherCommand::Maintain { response },
            "maintain",
        )
        .await
    }

    /// Shutdown the dispatcher, waiting for in-flight jobs up to the
    /// configured timeout.
    pub async fn shutdown(&self) -> Result<(), DispatcherError> {
        self.send_unit_command(
            |response| DispatcherCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current dispatcher state.
    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Check if the dispatcher is running.
    pub fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    /// Check if the dispatcher is paused.
    pub fn is_paused(&self) -> bool {
        self.state() == DispatcherState::Paused
    }
}
