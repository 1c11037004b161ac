//! Error types for gated REPL sessions.

use thiserror::Error;

use crate::efsm::ReplState;

/// Top-level error type for session operations.
///
/// Runtime faults inside sandboxed code are not errors at this level; they
/// are reported through [`crate::sandbox::ExecutionResult`] with
/// `success == false`.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation invoked from a state the transition table does not allow.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: ReplState, to: ReplState },

    /// No session is registered under this identifier.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A session with this identifier is already registered.
    #[error("session already exists: {0}")]
    SessionExists(String),

    /// The session has used up its iteration budget.
    #[error("iteration limit of {limit} reached")]
    IterationLimit { limit: u32 },

    /// Finalize referenced a variable that is not in the namespace.
    #[error("variable '{name}' not found (available: {})", available.join(", "))]
    UnknownVariable { name: String, available: Vec<String> },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The external state store failed.
    #[error("state store error: {0}")]
    StateStore(String),

    /// The task running an approved submission did not complete.
    #[error("execution error: {0}")]
    Execution(String),

    /// IO error while staging session resources.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
