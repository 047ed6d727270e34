//! Error types for AtlasArray
//!
//! Provides a unified error type for all operations, plus the mapping onto
//! the coarse error taxonomy and binary status codes used at a C-style call
//! boundary.

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Status returned by a boundary call that succeeded
pub const STATUS_OK: i32 = 0;

/// Status returned by a boundary call that failed
pub const STATUS_ERR: i32 = -1;

/// Unified error type for AtlasArray operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Schema Errors
    // -------------------------------------------------------------------------
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Not found: {0}")]
    NotFound(String),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // -------------------------------------------------------------------------
    // On-disk Format Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Concurrency violation: {0}")]
    ConcurrencyViolation(String),

    #[error("Background worker failed: {0}")]
    Worker(String),
}

impl From<bincode::Error> for AtlasError {
    fn from(e: bincode::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}

/// Coarse error classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or inconsistent schema at creation or load time
    SchemaError,
    /// Session attributes/types disagree with the supplied buffers
    SchemaMismatch,
    /// Filesystem read/write/open failure, or unreadable on-disk data
    IoFailure,
    /// Path, attribute or object absent
    NotFound,
    /// Advisory lock conflict
    ConcurrencyViolation,
    /// Caller passed bad arguments or called in the wrong mode
    InvalidArgument,
}

impl AtlasError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AtlasError::Schema(_) => ErrorKind::SchemaError,
            AtlasError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            AtlasError::Io(_)
            | AtlasError::Corruption(_)
            | AtlasError::Serialization(_)
            | AtlasError::Compression(_)
            | AtlasError::Worker(_) => ErrorKind::IoFailure,
            AtlasError::NotFound(_) => ErrorKind::NotFound,
            AtlasError::ConcurrencyViolation(_) => ErrorKind::ConcurrencyViolation,
            AtlasError::InvalidInput(_)
            | AtlasError::InvalidOperation(_)
            | AtlasError::Config(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// Collapse a result into the binary status of a C-style boundary call.
///
/// Failures are logged before being flattened so the detail is not lost.
pub fn status<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => {
            tracing::debug!(kind = ?e.kind(), "boundary call failed: {}", e);
            STATUS_ERR
        }
    }
}
