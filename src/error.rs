use thiserror::Error;

use crate::event::state::RoundStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Infeasible pool: {reason}")]
    Infeasible { reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error("Cannot {operation} while the event is {status}")]
    InvalidTransition { operation: &'static str, status: RoundStatus },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Commit failed: {0}")]
    CommitFailure(#[from] StoreError),

    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("All {total} rounds have been played")]
    RoundsExhausted { total: u32 },

    #[error("Signal rejected: {0}")]
    SignalRejected(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether repeating the same call may succeed without any other change.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::CommitFailure(_) => true,
            EngineError::Internal(_) => true,
            _ => false,
        }
    }
}
