//! Errors surfaced by the runtime's public operations.
//!
//! Validation (`InvalidCommand`, `Rejected`) and `NotFound` are ordinary
//! outcomes the caller recovers from; they are surfaced unchanged and never
//! logged as errors. `JournalFailure` is fatal for the current command and is
//! also traced for operational visibility. `Internal` marks a broken runtime
//! invariant; the aggregate worker that hit it is killed.

use crate::{Aggregate, EventEnvelope};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CqrsError {
    /// No behavior clause matched the command.
    #[error("invalid command {command} for aggregate {aggregate_id:?}")]
    InvalidCommand {
        command: String,
        aggregate_id: Option<String>,
    },

    /// The behavior examined the command and refused it. No events were
    /// written and the aggregate state is unchanged.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// Storage-level failure while appending or replaying events.
    #[error("journal failure: {0}")]
    JournalFailure(String),

    /// The caller stopped waiting. The underlying operation may still have
    /// completed; a queued command is attempted exactly once regardless.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("aggregate '{0}' not found")]
    NotFound(String),

    /// The projection exhausted its retries and stopped consuming.
    #[error("projection '{0}' is stalled")]
    StalledProjection(String),

    /// Broken runtime invariant (non-monotonic sequence, duplicate event id,
    /// dead worker). Never produced by well-behaved domain code.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CqrsError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn invalid_command(command: &impl Debug, aggregate_id: Option<String>) -> Self {
        Self::InvalidCommand {
            command: format!("{:?}", command),
            aggregate_id,
        }
    }

    pub fn journal(detail: impl std::fmt::Display) -> Self {
        Self::JournalFailure(detail.to_string())
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::Internal(detail.to_string())
    }

    /// True for the variants that mark programming errors rather than
    /// recoverable outcomes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Failure of a projection join.
///
/// `Command` means the submission itself failed and nothing was committed.
/// `Projection` means the write succeeded but the read side did not confirm
/// in time; it carries the committed events so the caller knows what landed.
#[derive(Debug, Error)]
pub enum JoinError<A: Aggregate> {
    #[error(transparent)]
    Command(#[from] CqrsError),

    #[error("projection join failed: {cause}")]
    Projection {
        events: Vec<EventEnvelope<A>>,
        cause: CqrsError,
    },
}

impl<A: Aggregate> JoinError<A> {
    /// The events the command committed before the join failed. Empty when
    /// the submission itself failed.
    pub fn committed_events(&self) -> &[EventEnvelope<A>] {
        match self {
            Self::Command(_) => &[],
            Self::Projection { events, .. } => events,
        }
    }

    pub fn cause(&self) -> &CqrsError {
        match self {
            Self::Command(cause) => cause,
            Self::Projection { cause, .. } => cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display() {
        let err = CqrsError::rejected("Price is too low!");
        assert_eq!(err.to_string(), "command rejected: Price is too low!");
    }

    #[test]
    fn test_invalid_command_carries_target() {
        #[derive(Debug)]
        struct Noop;
        let err = CqrsError::invalid_command(&Noop, Some("p-1".to_string()));
        assert!(err.to_string().contains("Noop"));
        assert!(err.to_string().contains("p-1"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CqrsError::internal("boom").is_fatal());
        assert!(!CqrsError::rejected("no").is_fatal());
        assert!(!CqrsError::NotFound("x".into()).is_fatal());
    }
}
