//! Error taxonomy for the scheduling crate.
//!
//! Validation failures surface to the caller as tool-call errors; store
//! failures abort the current operation; execution failures are captured by
//! the driver and persisted, never propagated.

use crate::store::StoreError;
use crate::trigger::TriggerError;

/// Errors surfaced by scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The referenced task does not exist.
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Malformed or inconsistent arguments.
    #[error("{0}")]
    Validation(String),

    /// Trigger config rejected at registration time.
    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// Underlying persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
