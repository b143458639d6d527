//! Error taxonomy for topology operations.
//!
//! Every failure here is recoverable at the operation boundary: the registry
//! stays queryable and further mutable after any reported error.

use thiserror::Error;

use crate::bus::BusRequest;
use crate::channel::ChannelError;
use crate::iothread::IoThreadError;

/// Errors raised by [`TopologyRegistry::insert`](crate::TopologyRegistry::insert).
///
/// Always fully transactional: by the time one of these surfaces, every
/// partial side effect of the same top-level insert call has been undone.
#[derive(Debug, Error)]
pub enum InsertError {
    /// No bus in the registry matches the named requirement.
    #[error("no bus matches requirement {0}")]
    NoMatchingBus(BusRequest),

    /// Matching buses exist but none has a free slot for the requirement.
    #[error("no free slot for requirement {0}")]
    NoFreeSlot(BusRequest),

    /// A device with the same symbolic id is already registered.
    #[error("duplicate symbolic id: {0}")]
    DuplicateId(String),

    /// A child bus the device would create collides with an existing bus id.
    #[error("duplicate bus id: {0}")]
    DuplicateBus(String),

    /// Bus expansion kept demanding auxiliary devices without converging.
    #[error("bus expansion for requirement {0} did not converge")]
    ExpansionDiverged(BusRequest),

    /// I/O thread assignment failed.
    #[error("iothread assignment failed")]
    IoThread(#[from] IoThreadError),
}

/// Errors raised by [`TopologyRegistry::remove`](crate::TopologyRegistry::remove).
#[derive(Debug, Error)]
pub enum RemoveError {
    /// No device with the given alias is registered.
    #[error("no device with alias {0:?}")]
    NotFound(String),
}

/// Errors raised by the hotplug half of the transaction engine.
#[derive(Debug, Error)]
pub enum HotplugError {
    /// The insert step failed; the registry is unchanged beyond the
    /// dirtiness counter.
    #[error("hotplug insert failed")]
    Insert(#[from] InsertError),

    /// A single hotplug request cascaded into more than one device, which
    /// the live protocol cannot express as one operation.
    #[error("hotplug of one device inserted {0} devices")]
    UnexpectedCascade(usize),

    /// The device kind has no live-attach encoding.
    #[error("device {0:?} does not support hotplug")]
    Unsupported(String),

    /// The command channel failed outright (not a timeout).
    #[error("command channel failure")]
    Channel(#[source] ChannelError),
}

/// Errors raised by the unplug half of the transaction engine.
///
/// The two divergence shapes are deliberately distinct variants: a device
/// confirmed gone live but stuck in the representation is a different
/// situation from a representation already cleaned while the live side
/// reported failure, and callers recover differently from each.
#[derive(Debug, Error)]
pub enum UnplugError {
    /// No device with the given alias is registered.
    #[error("no device with alias {0:?}")]
    NotFound(String),

    /// The device kind has no live-detach encoding.
    #[error("device {0:?} does not support unplug")]
    Unsupported(String),

    /// The command channel failed before the detach was issued.
    #[error("command channel failure")]
    Channel(#[source] ChannelError),

    /// Live removal was confirmed but the in-memory removal failed.
    #[error("device {aid:?} removed live but stuck in representation")]
    StuckInRepresentation {
        /// Alias of the affected device.
        aid: String,
        /// The underlying representation failure.
        #[source]
        source: RemoveError,
    },

    /// Part of the representation was already removed while the live side
    /// never confirmed the detach of the named node.
    #[error("node {aid:?} unconfirmed live after representation cleanup began")]
    LiveUnconfirmed {
        /// Alias of the unconfirmed node.
        aid: String,
    },

    /// The post-confirmation cleanup hook failed; the rollback marker hook
    /// has already run.
    #[error("unplug hook failed for {aid:?}: {reason}")]
    Hook {
        /// Alias of the affected device.
        aid: String,
        /// Failure description from the hook.
        reason: String,
    },
}

/// Result alias for insert operations.
pub type InsertResult<T> = std::result::Result<T, InsertError>;
