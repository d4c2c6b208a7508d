//! Error types for the versioning engine

use std::fmt;
use thiserror::Error;

/// Result type for versioning operations
pub type Result<T> = std::result::Result<T, TrailError>;

/// Configuration errors raised while registering models and version targets.
///
/// These are intentionally loud: they surface at setup time, before any
/// version is recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The model points at a version target that was never registered
    #[error("Model {model} uses unknown version target {target}")]
    UnknownVersionTarget { model: String, target: String },

    /// The model points at a version target that cannot hold rows
    #[error(
        "Model {model} is configured to record into {target}, which is abstract; \
         models must use a concrete version target"
    )]
    AbstractVersionTarget { model: String, target: String },

    /// Recording after destroy would orphan a mandatory parent reference
    #[error(
        "Model {model} records destroy events after deletion, which is incompatible \
         with a mandatory parent reference; record before deletion instead"
    )]
    CannotRecordAfterDestroy { model: String },

    /// A filter list or association names an attribute the schema lacks
    #[error("Model {model} lists unknown attribute {attribute} in {list}")]
    UnknownAttribute {
        model: String,
        attribute: String,
        list: &'static str,
    },

    /// The same model name was registered twice
    #[error("Model {model} is already registered")]
    DuplicateModel { model: String },

    /// The same version target name was registered twice
    #[error("Version target {target} is already registered")]
    DuplicateVersionTarget { target: String },

    /// A process-wide setting could not be parsed
    #[error("Invalid setting {key}: {message}")]
    InvalidSetting { key: String, message: String },
}

/// Main error type for versioning operations
#[derive(Error, Debug)]
pub enum TrailError {
    /// Model or version target misconfiguration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A version references an item type with no registered model
    #[error("No model registered for item type {item_type}")]
    UnknownModel { item_type: String },

    /// The stored snapshot text could not be parsed at all
    #[error("Version {version_id} has a corrupt {field}: {message}")]
    CorruptSnapshot {
        version_id: i64,
        field: &'static str,
        message: String,
    },

    /// The persistence boundary rejected a read or write
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// The deferred-work queue rejected a job
    #[error("Queue error: {message}")]
    Queue { message: String },

    /// Data serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wrapper for other error types
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrailError {
    /// Create a storage error
    pub fn storage(message: impl fmt::Display) -> Self {
        Self::Storage {
            message: message.to_string(),
        }
    }

    /// Create a queue error
    pub fn queue(message: impl fmt::Display) -> Self {
        Self::Queue {
            message: message.to_string(),
        }
    }

    /// Create an unknown model error
    pub fn unknown_model(item_type: impl Into<String>) -> Self {
        Self::UnknownModel {
            item_type: item_type.into(),
        }
    }

    /// Check if this error was raised at configuration time
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
