//! Error types for telepipe.
//!
//! This module defines the crate-wide error type. Narrower failure types live
//! next to the code that produces them (`DecodeFailure` in
//! [`crate::crypto::decrypt`], `TransportFailure` in [`crate::transport`],
//! `HandoffError` in [`crate::crypto::handoff`]). Missing key material and
//! send timeouts are reported through those narrower types, each with its own
//! retry predicate.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for telepipe operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the dead-letter database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Key Material Errors ===
    /// Key material was re-provisioned with different bytes.
    #[error("key material already provisioned with different contents")]
    KeyMismatch,

    /// Key or IV bytes are malformed.
    #[error("invalid key material: {message}")]
    InvalidKeyMaterial {
        /// Description of what is wrong with the key or IV.
        message: String,
    },

    // === Pipeline Errors ===
    /// An event failed ingress validation.
    #[error("invalid event: {reason}")]
    InvalidEvent {
        /// Why the event was rejected.
        reason: String,
    },

    /// Two distinct URLs produced the same cache key fingerprint.
    #[error("cache key {key} already holds series for {existing}, rejected {incoming}")]
    CacheKeyCollision {
        /// The rendered cache key.
        key: String,
        /// URL already stored under the key.
        existing: String,
        /// URL of the rejected event.
        incoming: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for telepipe operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an invalid key material error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKeyMaterial {
            message: message.into(),
        }
    }

    /// Create an invalid event error.
    #[must_use]
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Create a configuration validation error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Check if this error is a cache key collision.
    #[must_use]
    pub fn is_collision(&self) -> bool {
        matches!(self, Self::CacheKeyCollision { .. })
    }
}
