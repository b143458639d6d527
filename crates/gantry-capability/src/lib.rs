//! # gantry-capability
//!
//! Capability snapshots for the target hypervisor process.
//!
//! A [`CapabilitySet`] is built once per target-process identity from the
//! probed version string and a set of symbolic [`Capability`] flags, and is
//! read-only afterwards. Construction logic queries flags as opaque booleans
//! instead of branching on raw version numbers, so "what version introduced
//! X" lives in one table ([`CapabilitySet::from_version`]) and everything
//! downstream only asks "do we have X".

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod set;
pub mod version;

pub use set::{Capability, CapabilitySet};
pub use version::{Bound, Version, VersionSpan};

use thiserror::Error;

/// Errors raised while building capability data.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// A version string could not be parsed.
    #[error("invalid version string: {0:?}")]
    InvalidVersion(String),
}

/// Result type alias for capability operations.
pub type Result<T> = std::result::Result<T, CapabilityError>;
