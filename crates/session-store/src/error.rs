use thiserror::Error;

/// Errors that can occur when interacting with the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A compare-and-set status update lost a race: the row no longer
    /// holds the expected status.
    #[error("Stale {entity} status for {id}: expected {expected}, found {actual}")]
    StaleStatus {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    /// The record addressed by an update does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness or set-once rule would be violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<common::UnknownStatus> for StoreError {
    fn from(err: common::UnknownStatus) -> Self {
        StoreError::CorruptRecord(err.to_string())
    }
}

impl From<common::UnknownProvider> for StoreError {
    fn from(err: common::UnknownProvider) -> Self {
        StoreError::CorruptRecord(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
