//! # gantry-builder
//!
//! Translates declarative machine specifications into topology inserts.
//!
//! - [`MachineSpec`] and friends: the plain record tree handed in by the
//!   caller (the schema is an external contract)
//! - [`MachineBuilder`]: capability-gated translation into a populated
//!   [`TopologyRegistry`](gantry_topology::TopologyRegistry)
//! - [`emit`]: serialization entry points re-exported from the engine
//!
//! Every encoding fork — flat drive fragments vs. the structured storage
//! node graph, daemon-served backends, I/O thread pooling — is decided by
//! an opaque capability flag computed once, so the same builder code can be
//! exercised against synthetic capability sets in tests.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod build;
pub mod error;
pub mod spec;

/// Serialization entry points for finished topologies.
pub mod emit {
    pub use gantry_topology::serialize::{
        command_fragments, command_line, daemon_commands, node_graph, NodeGraph,
    };
}

pub use build::MachineBuilder;
pub use error::{BuilderError, Result};
pub use spec::{
    Chipset, ControllerKind, ControllerSpec, DiskFormat, DiskSpec, IoThreadSchemeSpec,
    IoThreadSpec, MachineSpec, NicSpec, SerialSpec,
};
