//! The daemon contract every backend subsystem implements.

use async_trait::async_trait;
use thiserror::Error;

/// Startup or shutdown failure of a subsystem.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The subsystem could not start; the backend aborts startup.
    #[error("{daemon} failed to start: {reason}")]
    StartFailed {
        /// Subsystem name.
        daemon: &'static str,
        /// Diagnostic.
        reason: String,
    },

    /// The subsystem did not stop within the grace period.
    #[error("{daemon} did not stop cleanly: {reason}")]
    StopFailed {
        /// Subsystem name.
        daemon: &'static str,
        /// Diagnostic.
        reason: String,
    },
}

/// A long-running backend subsystem with explicit lifecycle.
///
/// `start` spawns the subsystem's tasks and returns once it is accepting
/// work. `stop` requests cancellation and waits for the drain, bounded by
/// the backend's grace period. Errors after startup are the subsystem's
/// own to recover from; only startup aborts the process.
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Stable subsystem name, used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Spawns the subsystem.
    async fn start(&mut self) -> Result<(), DaemonError>;

    /// Cancels and drains the subsystem.
    async fn stop(&mut self) -> Result<(), DaemonError>;
}
