//! Core error types for pillbox-core.
//!
//! Expected outcomes (an already-taken dose, a timer firing for a deleted
//! schedule) are modeled as tagged results on the operations themselves;
//! this hierarchy is reserved for genuine failures.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for pillbox-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Validation errors raised at the schedule API boundary.
///
/// A schedule that fails validation is rejected synchronously; no partial
/// schedule or alarm is ever created for it.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Compartment number outside the physical box
    #[error("Invalid compartment number {0}: must be 1 or 2")]
    InvalidCompartment(u8),

    /// Schedule without any active weekday
    #[error("Schedule must cover at least one day of the week")]
    EmptyDays,

    /// Non-positive pill count
    #[error("Invalid pill count {0}: must be greater than zero")]
    InvalidPillCount(u32),

    /// Sensor light threshold outside the calibrated range
    #[error("Invalid light threshold {value} for compartment {compartment}: must be 0-100")]
    InvalidThreshold { compartment: u8, value: u16 },

    /// Unparseable time-of-day input
    #[error("Invalid time of day: {0}")]
    InvalidTime(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(DatabaseError::from(err))
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
