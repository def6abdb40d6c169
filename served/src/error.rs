//! Error types for the transaction engine.

use crate::machine::{Event, StateId};

/// Alias for `Result<T, served::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by machines, the orchestrator, and the inventory.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A transition named a state the table does not define.
    #[error("unknown state {0:?}")]
    UnknownState(StateId),

    /// A non-terminal state is missing its mandatory Failed transition.
    #[error("state {0:?} has no Failed transition")]
    MissingFailedTransition(StateId),

    /// No transition matches the fired event in the current state.
    #[error("state {state:?} has no transition for {event:?}")]
    NoTransition {
        /// Current state.
        state: StateId,
        /// The event that was fired.
        event: Event,
    },

    /// An event was fired on a machine already in a terminal state.
    #[error("machine is terminal ({0:?})")]
    Terminal(StateId),

    /// The transaction kind has no transition set.
    #[error("no transition set for {0}")]
    NoTransitionSet(String),

    /// No transaction with the given id.
    #[error("unknown transaction {0}")]
    UnknownTransaction(u32),

    /// Persistence I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Persistence encoding failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
