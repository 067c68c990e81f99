use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid interval: start {start} must be before end {end}")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("booking start {start} is in the past (now {now})")]
    PastBooking { start: Ms, now: Ms },
    #[error("resource {0} is inactive")]
    InactiveResource(Ulid),
    #[error("booking {id} is {status}: {action} not allowed")]
    IllegalTransition {
        id: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    #[error("booking {0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("booking {0} is already completed")]
    AlreadyCompleted(Ulid),
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("cannot delete resource {id}: {count} active booking(s)")]
    HasActiveDependents { id: Ulid, count: usize },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// Coarse classification of [`EngineError`], one per caller-visible failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidInterval,
    PastBooking,
    InvalidState,
    AlreadyCancelled,
    AlreadyCompleted,
    Conflict,
    HasActiveDependents,
    LimitExceeded,
    Storage,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::InvalidInterval { .. } => ErrorKind::InvalidInterval,
            EngineError::PastBooking { .. } => ErrorKind::PastBooking,
            EngineError::InactiveResource(_) | EngineError::IllegalTransition { .. } => {
                ErrorKind::InvalidState
            }
            EngineError::AlreadyCancelled(_) => ErrorKind::AlreadyCancelled,
            EngineError::AlreadyCompleted(_) => ErrorKind::AlreadyCompleted,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::HasActiveDependents { .. } => ErrorKind::HasActiveDependents,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_covers_inactive_and_transitions() {
        let id = Ulid::nil();
        assert_eq!(EngineError::InactiveResource(id).kind(), ErrorKind::InvalidState);
        let e = EngineError::IllegalTransition {
            id,
            status: BookingStatus::Completed,
            action: "cancel",
        };
        assert_eq!(e.kind(), ErrorKind::InvalidState);
        assert!(e.to_string().contains("completed: cancel not allowed"));
    }

    #[test]
    fn dependents_message_carries_count() {
        let e = EngineError::HasActiveDependents {
            id: Ulid::nil(),
            count: 3,
        };
        assert!(e.to_string().ends_with("3 active booking(s)"));
        assert_eq!(e.kind(), ErrorKind::HasActiveDependents);
    }
}
