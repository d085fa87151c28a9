// src/errors.rs

use thiserror::Error;

/// Error categories the engine distinguishes for callers. Everything else
/// travels as a plain `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Rejected before any matching or merge work began.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced row is missing; the operation is aborted entirely.
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    /// Rollback requires human intent once; a second attempt is refused.
    #[error("merge log {0} has already been rolled back")]
    AlreadyRolledBack(String),

    /// The merge being rolled back participates in a later merge chain.
    /// Unwinding must happen newest-first.
    #[error("merge log {0} conflicts with later merge {1}; roll back the later merge first")]
    MergeChainConflict(String, String),

    /// The stored snapshot was written by an incompatible schema version.
    #[error("unsupported merge snapshot schema version {found} (expected {expected})")]
    SnapshotSchema { found: u32, expected: u32 },
}
