//! Crate-wide error types.
//!
//! Each error enum maps onto one of the "Error kinds" of the runtime
//! specification: path traversal, action dispatch, agent-tree mutation,
//! scheduler ticks, AI transport, and storage. `InsolventAgent` has no
//! corresponding variant anywhere — it is a due-set filter predicate in the
//! scheduler, never a constructed error.

use thiserror::Error;

/// Errors from the path engine (`crate::path`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Traversal could not proceed at the given path.
    #[error("path not found: {0}")]
    NotFound(String),
    /// `set`/`delete` received the empty (root) path.
    #[error("path is empty")]
    Empty,
}

/// Errors from action dispatch (`crate::action`).
#[derive(Debug, Error)]
pub enum ActionError {
    /// No action is registered under this name.
    #[error("action not found: {0}")]
    NotFound(String),
    /// A required parameter was missing from the call.
    #[error("missing parameter '{param}' for action '{action}'")]
    MissingParameter {
        /// Action name.
        action: String,
        /// Missing parameter name.
        param: String,
    },
    /// A parameter value did not match the expected shape.
    #[error("invalid parameter '{param}' for action '{action}': {reason}")]
    InvalidParameter {
        /// Action name.
        action: String,
        /// Parameter name.
        param: String,
        /// Human-readable reason.
        reason: String,
    },
    /// The callback itself failed.
    #[error("action '{action}' failed: {reason}")]
    Failed {
        /// Action name.
        action: String,
        /// Failure reason.
        reason: String,
    },
}

/// Errors from agent-tree mutation (`crate::agent`).
#[derive(Debug, Error)]
pub enum AgentError {
    /// Path engine error, bubbled up from knowledge/purpose/self operations.
    #[error(transparent)]
    Path(#[from] PathError),
    /// Action dispatch error.
    #[error(transparent)]
    Action(#[from] ActionError),
    /// `create_child` was given a `template_id` absent from this tree.
    #[error("template agent not found: {0}")]
    TemplateNotFound(String),
    /// A child lookup by id failed.
    #[error("child not found: {0}")]
    ChildNotFound(String),
    /// `sleep` was called with a negative duration, which would move the
    /// heartbeat clock backward.
    #[error("sleep duration must be non-negative, got {0}")]
    NegativeSleep(i64),
}

/// Errors surfaced by the heartbeat scheduler (`crate::scheduler`).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The AI transport failed for this tick.
    #[error(transparent)]
    Transport(#[from] crate::providers::ProviderError),
    /// The agent tree could not be walked/mutated.
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Errors from the persistence engine (`crate::storage`).
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying database error.
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored JSON column failed to parse.
    #[error("corrupt JSON column '{column}': {source}")]
    CorruptJson {
        /// Column name.
        column: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A stored row had a malformed id, timestamp, or other non-JSON field.
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    /// Migrations failed to apply.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// A malformed AI reply. Per spec this is non-fatal: callers treat the
/// affected agent's action list as empty rather than aborting the tick.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid AI reply: {0}")]
pub struct InvalidReply(pub String);
