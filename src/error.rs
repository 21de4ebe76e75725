//! Error types for the broker store

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the broker store
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// Store (or one of its tiers) is at capacity
    #[error(
        "{tier} of '{storage_id}' overflows: {entries}/{max_entries} entries, \
         {bytes}/{max_bytes} bytes"
    )]
    ResourceOverflow {
        storage_id: String,
        tier: &'static str,
        entries: u64,
        max_entries: u64,
        bytes: u64,
        max_bytes: u64,
    },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Persistent tier is required but its connection is down
    #[error("Persistent tier of '{storage_id}' is not available")]
    PersistenceUnavailable { storage_id: String },

    /// Persistent backend failed an operation
    #[error("Persistence failure on '{storage_id}': {reason}")]
    Persistence { storage_id: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Malformed store configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Settings file could not be parsed
    #[error("Failed to parse settings: {0}")]
    Serialization(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    /// Metric registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for capacity rejections the caller may handle (dead letter, block, reject)
    pub fn is_overflow(&self) -> bool {
        matches!(self, Error::ResourceOverflow { .. })
    }

    /// True when the persistent tier could not be reached or failed
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::PersistenceUnavailable { .. } | Error::Persistence { .. }
        )
    }
}
