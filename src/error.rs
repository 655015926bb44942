//! Error types for the flash-sale coordination core
//!
//! Only faults live here. Expected outcomes such as "not found", a lost
//! lock race or a rejected reservation are plain values returned by the
//! component that produced them.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the coordination core
#[derive(Error, Debug)]
pub enum Error {
    /// Key-value store or collaborator store failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A cached value could not be interpreted
    #[error("Corrupt cache entry at {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// Bounded lock acquisition gave up
    #[error("Lock contention on {name} after {attempts} attempts")]
    LockContention { name: String, attempts: u32 },

    /// Background cache rebuild failed
    #[error("Cache rebuild failed for {key}: {reason}")]
    RebuildFailed { key: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `StoreUnavailable` error from anything displayable.
    pub fn store(reason: impl std::fmt::Display) -> Self {
        Error::StoreUnavailable(reason.to_string())
    }

    /// True when the error came from the backing store rather than from
    /// this crate's own logic.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Redis(_))
    }
}
