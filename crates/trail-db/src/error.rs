//! Error types for the SQL-backed version store

use thiserror::Error;
use trail::TrailError;

/// Result type for database store operations
pub type Result<T> = std::result::Result<T, DbStoreError>;

#[derive(Error, Debug)]
pub enum DbStoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Metadata column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row names an event this build does not know
    #[error("Version {version_id} has unknown event {event}")]
    InvalidEvent { version_id: i64, event: String },
}

impl From<DbStoreError> for TrailError {
    fn from(err: DbStoreError) -> Self {
        match err {
            DbStoreError::Serialization(e) => TrailError::Serialization(e),
            other => TrailError::storage(other),
        }
    }
}
