//! Error types for the catalog synchronization engine.

use thiserror::Error;

/// Errors that can occur during catalog maintenance operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The catalog store could not be reached or rejected a statement.
    #[error("Catalog store error: {0}")]
    StoreAccess(#[from] sqlx::Error),

    /// Store failure not originating from the database driver.
    #[error("Catalog store error: {0}")]
    Store(String),

    /// A remote artifact collection could not be reached at all.
    #[error("External fetch failed: {0}")]
    ExternalFetch(String),

    /// A task with this name is already registered.
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    /// No task with this name is registered.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A schedule expression could not be parsed.
    #[error("Invalid schedule '{expression}': {message}")]
    InvalidSchedule {
        /// The offending expression.
        expression: String,
        /// Parser diagnostic.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A bulk operation is already in flight.
    #[error("Bulk operation already running: {0}")]
    Busy(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for catalog maintenance operations.
pub type SyncResult<T> = Result<T, SyncError>;
