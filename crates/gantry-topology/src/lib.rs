//! # gantry-topology
//!
//! Device/bus topology engine for a VM instance driven by an external
//! hypervisor process.
//!
//! - [`registry`]: the authoritative in-memory topology with transactional
//!   insert/remove
//! - [`bus`] / [`address`]: attachment points and slot allocation
//! - [`device`]: the closed union of emitted configuration units
//! - [`hotplug`]: live attach/detach with external verification
//! - [`iothread`]: shared I/O thread pool
//! - [`serialize`]: linear fragments and the storage node graph
//! - [`channel`]: the abstract command boundary to the live process
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 TopologyRegistry                  │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────────────┐  │
//! │  │ devices  │ │  buses   │ │  IoThreadPool    │  │
//! │  └────┬─────┘ └────┬─────┘ └──────────────────┘  │
//! │       │ insert/remove (transactional)            │
//! └───────┼────────────┼─────────────────────────────┘
//!         │            │
//!   ┌─────▼─────┐ ┌────▼────────┐
//!   │ Hotplug   │ │ Serializer  │
//!   │ Engine    │ │             │
//!   └─────┬─────┘ └─────────────┘
//!         │ CommandChannel
//!         ▼
//!   external hypervisor process
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod bus;
pub mod channel;
pub mod device;
pub mod error;
pub mod hotplug;
pub mod iothread;
pub mod params;
pub mod registry;
pub mod serialize;

pub use address::{Address, AddressShape, AddressSpace};
pub use bus::{resolve_bus_name, Admission, BusInstance, BusKind, BusRequest, ChildBus};
pub use channel::{ChannelError, CommandChannel, Output};
pub use device::{
    Attachment, Command, DeviceBody, DeviceFeature, DeviceNode, IoThreadWant, UnplugHooks,
};
pub use error::{HotplugError, InsertError, RemoveError, UnplugError};
pub use hotplug::{HotplugEngine, HotplugOutcome, PollTiming, UnplugOutcome};
pub use iothread::{IoThreadError, IoThreadHandle, IoThreadPool, IoThreadScheme};
pub use params::{ParamMap, ParamValue};
pub use registry::{SyncState, TopologyRegistry};
pub use serialize::{
    command_fragments, command_line, daemon_commands, node_graph, NodeGraph,
};
