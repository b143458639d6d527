//! Builder error taxonomy.

use gantry_capability::Capability;
use gantry_topology::InsertError;
use thiserror::Error;

/// Errors raised while translating a specification.
#[derive(Debug, Error)]
pub enum BuilderError {
    /// The target build lacks a capability the specification needs.
    #[error("target does not support {0}")]
    Unsupported(Capability),

    /// A topology insert failed.
    #[error(transparent)]
    Insert(#[from] InsertError),

    /// The specification itself is malformed.
    #[error("invalid specification: {0}")]
    InvalidSpec(String),
}

/// Result alias for builder operations.
pub type Result<T> = std::result::Result<T, BuilderError>;
