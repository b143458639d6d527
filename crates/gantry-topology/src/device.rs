//! Device model: one configuration unit per node.
//!
//! Devices are a closed tagged union over the six emitted unit shapes; every
//! dispatch point (hotplug, unplug, serialization) matches exhaustively on
//! [`DeviceBody`]. A device declares the parent-bus slots it consumes and
//! the child buses it creates; the registry fills in the assigned alias and
//! the concrete attachments.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::address::Address;
use crate::bus::{BusKind, BusRequest, ChildBus};
use crate::channel::{ChannelError, CommandChannel, Output};
use crate::iothread::IoThreadHandle;
use crate::params::{ParamMap, ParamValue};

/// One channel command with optional structured arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command name.
    pub name: String,
    /// Structured arguments.
    pub args: Option<Value>,
}

impl Command {
    /// Command without arguments.
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
        }
    }

    /// Command with arguments.
    #[must_use]
    pub fn with_args(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args: Some(args),
        }
    }
}

/// Boolean-queryable device features — never probed by error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFeature {
    /// Live attach via the command channel.
    Hotplug,
    /// Live detach via the command channel.
    Unplug,
    /// Eligible for an I/O thread assignment.
    IoThread,
}

/// Request for an I/O thread assignment, resolved by the registry's pool
/// during insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoThreadWant {
    /// Explicit thread name; `None` lets the pool's scheme decide.
    pub name: Option<String>,
}

/// Cleanup commands tied to the live-state transition of an unplug, not to
/// the in-memory removal. `unhook` is the best-effort rollback marker
/// issued when `hook` fails mid-way.
#[derive(Debug, Clone, PartialEq)]
pub struct UnplugHooks {
    /// Issued after live removal is confirmed.
    pub hook: Command,
    /// Issued when the hook itself fails.
    pub unhook: Command,
}

/// One satisfied parent-bus requirement: where the device actually sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Id of the bus holding the reservation.
    pub bus_id: String,
    /// Reserved address.
    pub address: Address,
    /// Dimension names of the bus shape, parallel to the address
    /// coordinates; used to emit per-dimension parameters.
    pub dims: Vec<String>,
}

/// Closed union over the emitted configuration unit shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceBody {
    /// Raw command fragment passed through verbatim.
    Raw {
        /// Pre-split fragment words.
        fragment: Vec<String>,
    },
    /// Structured parameterized device.
    Structured {
        /// Device driver name.
        driver: String,
    },
    /// Controller device owning one or more child buses.
    Controller {
        /// Device driver name.
        driver: String,
    },
    /// Storage-graph node wrapping raw backing store access.
    ProtocolNode {
        /// Generated node name.
        node: String,
        /// Protocol driver (`file`, `nbd`, ...).
        driver: String,
        /// Alias of the format node above this one, if linked.
        parent: Option<String>,
    },
    /// Storage-graph node wrapping the on-disk structure.
    FormatNode {
        /// Generated node name.
        node: String,
        /// Format driver (`raw`, `qcow2`, ...).
        driver: String,
        /// Alias of the node above this one in a backing chain, if linked.
        parent: Option<String>,
        /// Aliases of nodes below this one (protocol node, backing files).
        children: Vec<String>,
    },
    /// Device backed by an externally spawned daemon process.
    Daemon {
        /// Daemon invocation line, pre-split.
        argv: Vec<String>,
    },
}

/// One modeled configuration unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNode {
    qid: Option<String>,
    aid: Option<String>,
    body: DeviceBody,
    params: ParamMap,
    parent_buses: Vec<BusRequest>,
    child_buses: Vec<ChildBus>,
    iothread_want: Option<IoThreadWant>,
    unplug_hooks: Option<UnplugHooks>,
    attachments: Vec<Attachment>,
    iothread: Option<IoThreadHandle>,
}

impl DeviceNode {
    fn with_body(body: DeviceBody) -> Self {
        Self {
            qid: None,
            aid: None,
            body,
            params: ParamMap::new(),
            parent_buses: Vec::new(),
            child_buses: Vec::new(),
            iothread_want: None,
            unplug_hooks: None,
            attachments: Vec::new(),
            iothread: None,
        }
    }

    /// Raw command fragment.
    #[must_use]
    pub fn raw(fragment: &[&str]) -> Self {
        Self::with_body(DeviceBody::Raw {
            fragment: fragment.iter().map(|s| (*s).to_string()).collect(),
        })
    }

    /// Structured parameterized device.
    #[must_use]
    pub fn structured(driver: impl Into<String>) -> Self {
        Self::with_body(DeviceBody::Structured {
            driver: driver.into(),
        })
    }

    /// Bus-owning controller device.
    #[must_use]
    pub fn controller(driver: impl Into<String>) -> Self {
        Self::with_body(DeviceBody::Controller {
            driver: driver.into(),
        })
    }

    /// Storage protocol node.
    #[must_use]
    pub fn protocol_node(node: impl Into<String>, driver: impl Into<String>) -> Self {
        Self::with_body(DeviceBody::ProtocolNode {
            node: node.into(),
            driver: driver.into(),
            parent: None,
        })
    }

    /// Storage format node.
    #[must_use]
    pub fn format_node(node: impl Into<String>, driver: impl Into<String>) -> Self {
        Self::with_body(DeviceBody::FormatNode {
            node: node.into(),
            driver: driver.into(),
            parent: None,
            children: Vec::new(),
        })
    }

    /// Daemon-backed device.
    #[must_use]
    pub fn daemon(argv: &[&str]) -> Self {
        Self::with_body(DeviceBody::Daemon {
            argv: argv.iter().map(|s| (*s).to_string()).collect(),
        })
    }

    /// The root-port controller a PCI Express root complex demands before
    /// it can host an endpoint.
    #[must_use]
    pub fn root_port(complex_id: &str) -> Self {
        Self::controller("pcie-root-port")
            .with_parent_bus(BusRequest::named(BusKind::PcieRoot, complex_id).strict())
            .with_child_bus(ChildBus::new("pcie-port%d", BusKind::Pcie))
    }

    /// Sets the caller-chosen symbolic id.
    #[must_use]
    pub fn with_qid(mut self, qid: impl Into<String>) -> Self {
        self.qid = Some(qid.into());
        self
    }

    /// Adds a parent-bus requirement.
    #[must_use]
    pub fn with_parent_bus(mut self, req: BusRequest) -> Self {
        self.parent_buses.push(req);
        self
    }

    /// Adds a child bus created on insertion.
    #[must_use]
    pub fn with_child_bus(mut self, child: ChildBus) -> Self {
        self.child_buses.push(child);
        self
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.set(name, value);
        self
    }

    /// Requests an I/O thread assignment.
    #[must_use]
    pub fn with_iothread(mut self, name: Option<String>) -> Self {
        self.iothread_want = Some(IoThreadWant { name });
        self
    }

    /// Attaches unplug cleanup hooks.
    #[must_use]
    pub fn with_unplug_hooks(mut self, hooks: UnplugHooks) -> Self {
        self.unplug_hooks = Some(hooks);
        self
    }

    /// Declares a storage-graph child link (meaningful on format nodes).
    #[must_use]
    pub fn with_storage_child(mut self, child_aid: &str) -> Self {
        self.link_storage_child(child_aid);
        self
    }

    /// Declares the storage-graph parent link (storage nodes only).
    #[must_use]
    pub fn with_storage_parent(mut self, parent_aid: impl Into<String>) -> Self {
        self.set_storage_parent(Some(parent_aid.into()));
        self
    }

    /// Caller-chosen symbolic id.
    #[must_use]
    pub fn qid(&self) -> Option<&str> {
        self.qid.as_deref()
    }

    /// Registry-assigned alias; present once inserted.
    #[must_use]
    pub fn aid(&self) -> Option<&str> {
        self.aid.as_deref()
    }

    pub(crate) fn set_aid(&mut self, aid: String) {
        self.aid = Some(aid);
    }

    /// The body variant.
    #[must_use]
    pub const fn body(&self) -> &DeviceBody {
        &self.body
    }

    /// Named parameters.
    #[must_use]
    pub const fn params(&self) -> &ParamMap {
        &self.params
    }

    /// Mutable named parameters.
    pub fn params_mut(&mut self) -> &mut ParamMap {
        &mut self.params
    }

    /// Declared parent-bus requirements.
    #[must_use]
    pub fn parent_buses(&self) -> &[BusRequest] {
        &self.parent_buses
    }

    pub(crate) fn parent_buses_mut(&mut self) -> &mut Vec<BusRequest> {
        &mut self.parent_buses
    }

    /// Child-bus templates.
    #[must_use]
    pub fn child_buses(&self) -> &[ChildBus] {
        &self.child_buses
    }

    /// Pending I/O thread request.
    #[must_use]
    pub const fn iothread_want(&self) -> Option<&IoThreadWant> {
        self.iothread_want.as_ref()
    }

    /// Assigned I/O thread handle.
    #[must_use]
    pub const fn iothread(&self) -> Option<&IoThreadHandle> {
        self.iothread.as_ref()
    }

    pub(crate) fn set_iothread(&mut self, handle: Option<IoThreadHandle>) {
        self.iothread = handle;
    }

    /// Configured unplug hooks.
    #[must_use]
    pub const fn unplug_hooks(&self) -> Option<&UnplugHooks> {
        self.unplug_hooks.as_ref()
    }

    /// Concrete attachments filled in by the registry.
    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub(crate) fn attachments_mut(&mut self) -> &mut Vec<Attachment> {
        &mut self.attachments
    }

    /// Driver name for the bodies that have one.
    #[must_use]
    pub fn driver(&self) -> Option<&str> {
        match &self.body {
            DeviceBody::Structured { driver }
            | DeviceBody::Controller { driver }
            | DeviceBody::ProtocolNode { driver, .. }
            | DeviceBody::FormatNode { driver, .. } => Some(driver),
            DeviceBody::Raw { .. } | DeviceBody::Daemon { .. } => None,
        }
    }

    /// Generated storage node name, for storage-graph bodies.
    #[must_use]
    pub fn node_name(&self) -> Option<&str> {
        match &self.body {
            DeviceBody::ProtocolNode { node, .. } | DeviceBody::FormatNode { node, .. } => {
                Some(node)
            }
            _ => None,
        }
    }

    /// Base string for alias assignment: symbolic id, else driver, else a
    /// body-kind placeholder.
    #[must_use]
    pub fn alias_base(&self) -> String {
        if let Some(qid) = &self.qid {
            return qid.clone();
        }
        match &self.body {
            DeviceBody::Raw { .. } => "fragment".to_string(),
            DeviceBody::Daemon { .. } => "daemon".to_string(),
            _ => self
                .driver()
                .map_or_else(|| "dev".to_string(), ToString::to_string),
        }
    }

    /// The bus kind this device naturally sits on, when bus-addressable.
    #[must_use]
    pub fn natural_bus_kind(&self) -> Option<BusKind> {
        self.parent_buses.first().map(|r| r.kind)
    }

    /// Storage-graph children of this node.
    #[must_use]
    pub fn storage_children(&self) -> &[String] {
        match &self.body {
            DeviceBody::FormatNode { children, .. } => children,
            _ => &[],
        }
    }

    /// Storage-graph parent of this node.
    #[must_use]
    pub fn storage_parent(&self) -> Option<&str> {
        match &self.body {
            DeviceBody::ProtocolNode { parent, .. } | DeviceBody::FormatNode { parent, .. } => {
                parent.as_deref()
            }
            _ => None,
        }
    }

    pub(crate) fn link_storage_child(&mut self, child_aid: &str) {
        if let DeviceBody::FormatNode { children, .. } = &mut self.body {
            if !children.iter().any(|c| c == child_aid) {
                children.push(child_aid.to_string());
            }
        }
    }

    pub(crate) fn unlink_storage_child(&mut self, child_aid: &str) {
        if let DeviceBody::FormatNode { children, .. } = &mut self.body {
            children.retain(|c| c != child_aid);
        }
    }

    pub(crate) fn set_storage_parent(&mut self, parent_aid: Option<String>) {
        match &mut self.body {
            DeviceBody::ProtocolNode { parent, .. } | DeviceBody::FormatNode { parent, .. } => {
                *parent = parent_aid;
            }
            _ => {}
        }
    }

    /// Boolean feature query.
    #[must_use]
    pub const fn supports(&self, feature: DeviceFeature) -> bool {
        match feature {
            DeviceFeature::Hotplug | DeviceFeature::Unplug => matches!(
                self.body,
                DeviceBody::Structured { .. }
                    | DeviceBody::Controller { .. }
                    | DeviceBody::ProtocolNode { .. }
                    | DeviceBody::FormatNode { .. }
            ),
            DeviceFeature::IoThread => matches!(
                self.body,
                DeviceBody::Structured { .. } | DeviceBody::Controller { .. }
            ),
        }
    }

    fn param_args(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (name, value) in self.params.iter() {
            let v = match value {
                ParamValue::Str(s) | ParamValue::Symbol(s) => Value::String(s.clone()),
                ParamValue::Int(i) => Value::from(*i),
                ParamValue::Bool(b) => Value::from(*b),
                ParamValue::Hex(h) => Value::from(*h),
            };
            map.insert(name.to_string(), v);
        }
        map
    }

    /// The live-attach command for this device, when the body supports one.
    #[must_use]
    pub fn hotplug_command(&self) -> Option<Command> {
        match &self.body {
            DeviceBody::Structured { driver } | DeviceBody::Controller { driver } => {
                let mut args = self.param_args();
                args.insert("driver".into(), Value::String(driver.clone()));
                if let Some(aid) = &self.aid {
                    args.insert("id".into(), Value::String(aid.clone()));
                }
                if let Some(att) = self.attachments.first() {
                    args.insert("bus".into(), Value::String(att.bus_id.clone()));
                    for (dim, coord) in att.dims.iter().zip(att.address.coords()) {
                        args.insert(dim.clone(), Value::from(*coord));
                    }
                }
                Some(Command::with_args("device_add", Value::Object(args)))
            }
            DeviceBody::ProtocolNode { node, driver, .. }
            | DeviceBody::FormatNode { node, driver, .. } => {
                let mut args = self.param_args();
                args.insert("node-name".into(), Value::String(node.clone()));
                args.insert("driver".into(), Value::String(driver.clone()));
                Some(Command::with_args("blockdev_add", Value::Object(args)))
            }
            DeviceBody::Raw { .. } | DeviceBody::Daemon { .. } => None,
        }
    }

    /// The live-detach command for this device, when the body supports one.
    #[must_use]
    pub fn unplug_command(&self) -> Option<Command> {
        match &self.body {
            DeviceBody::Structured { .. } | DeviceBody::Controller { .. } => {
                let aid = self.aid.as_ref()?;
                Some(Command::with_args(
                    "device_del",
                    serde_json::json!({ "id": aid }),
                ))
            }
            DeviceBody::ProtocolNode { node, .. } | DeviceBody::FormatNode { node, .. } => Some(
                Command::with_args("blockdev_del", serde_json::json!({ "node-name": node })),
            ),
            DeviceBody::Raw { .. } | DeviceBody::Daemon { .. } => None,
        }
    }

    /// Confirms a hotplug: the issued command's output carries no error and
    /// the live listing mentions the device.
    ///
    /// # Errors
    ///
    /// Propagates channel failures from the listing query.
    pub fn verify_hotplug(
        &self,
        out: &Output,
        chan: &mut dyn CommandChannel,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        if out.is_error() {
            return Ok(false);
        }
        match &self.body {
            DeviceBody::Structured { .. } | DeviceBody::Controller { .. } => {
                let Some(aid) = self.aid.as_deref() else {
                    return Ok(false);
                };
                let list = chan.execute("device_list", None, timeout)?;
                Ok(list.mentions(aid))
            }
            DeviceBody::ProtocolNode { node, .. } | DeviceBody::FormatNode { node, .. } => {
                let list = chan.execute("node_list", None, timeout)?;
                Ok(list.mentions(node))
            }
            DeviceBody::Raw { .. } | DeviceBody::Daemon { .. } => Ok(false),
        }
    }

    /// Confirms an unplug: the live listing no longer mentions the device.
    ///
    /// # Errors
    ///
    /// Propagates channel failures from the listing query.
    pub fn verify_unplug(
        &self,
        out: &Output,
        chan: &mut dyn CommandChannel,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        if out.is_error() {
            return Ok(false);
        }
        match &self.body {
            DeviceBody::Structured { .. } | DeviceBody::Controller { .. } => {
                let Some(aid) = self.aid.as_deref() else {
                    return Ok(true);
                };
                let list = chan.execute("device_list", None, timeout)?;
                Ok(!list.mentions(aid))
            }
            DeviceBody::ProtocolNode { node, .. } | DeviceBody::FormatNode { node, .. } => {
                let list = chan.execute("node_list", None, timeout)?;
                Ok(!list.mentions(node))
            }
            DeviceBody::Raw { .. } | DeviceBody::Daemon { .. } => Ok(false),
        }
    }

    /// Short one-line description for topology listings.
    #[must_use]
    pub fn describe(&self) -> String {
        let name = self.aid.as_deref().unwrap_or("<detached>");
        let what = match &self.body {
            DeviceBody::Raw { fragment } => format!("raw[{}]", fragment.join(" ")),
            DeviceBody::Structured { driver } => driver.clone(),
            DeviceBody::Controller { driver } => format!("{driver} (controller)"),
            DeviceBody::ProtocolNode { node, driver, .. } => format!("proto:{driver}:{node}"),
            DeviceBody::FormatNode { node, driver, .. } => format!("fmt:{driver}:{node}"),
            DeviceBody::Daemon { argv } => format!("daemon[{}]", argv.join(" ")),
        };
        let mut line = format!("{name}: {what}");
        for att in &self.attachments {
            line.push_str(&format!(" @{}:{}", att.bus_id, att.address));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feature_queries_by_body() {
        assert!(DeviceNode::structured("e1000").supports(DeviceFeature::Hotplug));
        assert!(!DeviceNode::raw(&["-display", "none"]).supports(DeviceFeature::Hotplug));
        assert!(!DeviceNode::daemon(&["storage-daemon"]).supports(DeviceFeature::Unplug));
        assert!(!DeviceNode::format_node("fmt0", "qcow2").supports(DeviceFeature::IoThread));
    }

    #[test]
    fn hotplug_command_carries_attachment() {
        let mut dev = DeviceNode::structured("virtio-blk")
            .with_param("drive", "fmt0")
            .with_parent_bus(BusRequest::kind(BusKind::Pci));
        dev.set_aid("disk0".into());
        dev.attachments_mut().push(Attachment {
            bus_id: "pci.0".into(),
            address: Address::slot(3),
            dims: vec!["addr".into()],
        });

        let cmd = dev.hotplug_command().unwrap();
        assert_eq!(cmd.name, "device_add");
        assert_eq!(
            cmd.args.unwrap(),
            json!({
                "driver": "virtio-blk",
                "id": "disk0",
                "bus": "pci.0",
                "addr": 3,
                "drive": "fmt0",
            })
        );
    }

    #[test]
    fn node_commands_use_node_name() {
        let node = DeviceNode::protocol_node("proto0", "file").with_param("filename", "/x.img");
        let add = node.hotplug_command().unwrap();
        assert_eq!(add.name, "blockdev_add");
        let del = node.unplug_command().unwrap();
        assert_eq!(del.args.unwrap(), json!({ "node-name": "proto0" }));
    }

    #[test]
    fn raw_fragments_have_no_live_commands() {
        let dev = DeviceNode::raw(&["-display", "none"]);
        assert!(dev.hotplug_command().is_none());
        assert!(dev.unplug_command().is_none());
    }

    #[test]
    fn alias_base_prefers_qid() {
        assert_eq!(
            DeviceNode::structured("e1000").with_qid("net0").alias_base(),
            "net0"
        );
        assert_eq!(DeviceNode::structured("e1000").alias_base(), "e1000");
        assert_eq!(DeviceNode::raw(&["-x"]).alias_base(), "fragment");
    }

    #[test]
    fn storage_links_update_both_sides() {
        let mut fmt = DeviceNode::format_node("fmt0", "qcow2");
        fmt.link_storage_child("proto0");
        fmt.link_storage_child("proto0");
        assert_eq!(fmt.storage_children(), ["proto0"]);
        fmt.unlink_storage_child("proto0");
        assert!(fmt.storage_children().is_empty());
    }
}
