//! The authoritative in-memory topology.
//!
//! The registry owns the ordered device list and the bus list, threads the
//! structural invariants (unique aliases, no address collisions, satisfied
//! parent requirements) through every insert, and tracks the divergence
//! between the modeled topology and the live process as an inspectable
//! dirtiness counter.
//!
//! Insert is transactional: a failure at any depth of a cascading insert —
//! auxiliary controllers included — rolls back every side effect of the
//! same top-level call before the error surfaces.

use std::collections::HashMap;

use gantry_capability::CapabilitySet;

use crate::address::Address;
use crate::bus::{resolve_bus_name, Admission, BusInstance, BusRequest};
use crate::device::{DeviceFeature, DeviceNode};
use crate::error::{InsertError, RemoveError};
use crate::iothread::{IoThreadPool, IoThreadScheme};

/// Upper bound on bus-expansion retries for a single requirement.
const MAX_EXPANSION_ROUNDS: usize = 4;

/// Divergence between the modeled topology and the live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No live process is attached; the model is the only state.
    Detached,
    /// Attached, with N unconfirmed pending live operations (0 = in sync).
    Pending(u32),
}

impl SyncState {
    /// The inspectable counter value: −1 detached, 0 in sync, N pending.
    #[must_use]
    pub const fn dirtiness(self) -> i64 {
        match self {
            Self::Detached => -1,
            Self::Pending(n) => n as i64,
        }
    }
}

enum JournalOp {
    Reserved { bus_id: String, addr: Address },
    BusAdded { bus_id: String },
    DeviceAdded { aid: String },
}

/// The topology registry.
#[derive(Debug)]
pub struct TopologyRegistry {
    caps: CapabilitySet,
    order: Vec<String>,
    devices: HashMap<String, DeviceNode>,
    buses: Vec<BusInstance>,
    pool: IoThreadPool,
    sync: SyncState,
}

impl TopologyRegistry {
    /// Creates an empty registry bound to a capability snapshot, with
    /// I/O thread pooling disabled.
    #[must_use]
    pub fn new(caps: CapabilitySet) -> Self {
        Self::with_iothread_scheme(caps, IoThreadScheme::Disabled)
    }

    /// Creates an empty registry with an explicit I/O thread policy.
    #[must_use]
    pub fn with_iothread_scheme(caps: CapabilitySet, scheme: IoThreadScheme) -> Self {
        Self {
            caps,
            order: Vec::new(),
            devices: HashMap::new(),
            buses: Vec::new(),
            pool: IoThreadPool::new(scheme),
            sync: SyncState::Detached,
        }
    }

    /// The capability snapshot this registry was built with.
    #[must_use]
    pub const fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    // =========================================================================
    // Sync state
    // =========================================================================

    /// Current sync state.
    #[must_use]
    pub const fn sync_state(&self) -> SyncState {
        self.sync
    }

    /// Current dirtiness counter value.
    #[must_use]
    pub const fn dirtiness(&self) -> i64 {
        self.sync.dirtiness()
    }

    /// Marks a live process as attached (counter moves from −1 to 0).
    pub fn attach_live(&mut self) {
        if self.sync == SyncState::Detached {
            self.sync = SyncState::Pending(0);
        }
    }

    /// Records one initiated, unconfirmed live operation.
    pub fn mark_dirty(&mut self) {
        self.sync = match self.sync {
            SyncState::Detached => SyncState::Pending(1),
            SyncState::Pending(n) => SyncState::Pending(n + 1),
        };
    }

    /// Records one confirmed live operation. The counter only decreases
    /// here and never goes below zero.
    pub fn confirm(&mut self) {
        if let SyncState::Pending(n) = self.sync {
            self.sync = SyncState::Pending(n.saturating_sub(1));
        }
    }

    // =========================================================================
    // Buses
    // =========================================================================

    /// Registers a machine root bus (no owning device).
    ///
    /// # Errors
    ///
    /// Returns [`InsertError::DuplicateBus`] on an id collision.
    pub fn add_root_bus(&mut self, bus: BusInstance) -> Result<(), InsertError> {
        if self.bus_index(bus.id()).is_some() {
            return Err(InsertError::DuplicateBus(bus.id().to_string()));
        }
        tracing::debug!(bus = bus.id(), kind = %bus.kind(), "root bus registered");
        self.buses.push(bus);
        Ok(())
    }

    /// Bus by id.
    #[must_use]
    pub fn bus(&self, id: &str) -> Option<&BusInstance> {
        self.bus_index(id).map(|i| &self.buses[i])
    }

    /// All buses in registration order.
    #[must_use]
    pub fn buses(&self) -> &[BusInstance] {
        &self.buses
    }

    fn bus_index(&self, id: &str) -> Option<usize> {
        self.buses.iter().position(|b| b.id() == id)
    }

    /// Alias of the device occupying the given address, if any.
    #[must_use]
    pub fn occupant(&self, bus_id: &str, addr: &Address) -> Option<&str> {
        self.order.iter().map(String::as_str).find(|aid| {
            self.devices.get(*aid).is_some_and(|d| {
                d.attachments()
                    .iter()
                    .any(|a| a.bus_id == bus_id && &a.address == addr)
            })
        })
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Device by assigned alias.
    #[must_use]
    pub fn get(&self, aid: &str) -> Option<&DeviceNode> {
        self.devices.get(aid)
    }

    /// Device by caller-chosen symbolic id.
    #[must_use]
    pub fn get_by_qid(&self, qid: &str) -> Option<&DeviceNode> {
        self.order
            .iter()
            .filter_map(|aid| self.devices.get(aid))
            .find(|d| d.qid() == Some(qid))
    }

    /// Devices in insertion order.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceNode> {
        self.order.iter().filter_map(|aid| self.devices.get(aid))
    }

    /// Assigned aliases in insertion order.
    #[must_use]
    pub fn aids(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no devices are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Short human-readable topology listing.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for bus in &self.buses {
            out.push_str(&format!(
                "bus {} ({}) {}/{} reserved\n",
                bus.id(),
                bus.kind(),
                bus.space().reserved_count(),
                bus.space().shape().capacity(),
            ));
        }
        for dev in self.devices() {
            out.push_str(&dev.describe());
            out.push('\n');
        }
        out
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts a device, satisfying every declared parent-bus requirement
    /// and registering its child buses.
    ///
    /// Returns the aliases of every device inserted by the call, auxiliary
    /// devices first, the requested device last.
    ///
    /// # Errors
    ///
    /// Any [`InsertError`]; the registry is then observably identical to
    /// its state before the call.
    pub fn insert(&mut self, device: DeviceNode) -> Result<Vec<String>, InsertError> {
        let pool_snapshot = self.pool.clone();
        let mut journal = Vec::new();
        match self.insert_tx(device, &mut journal) {
            Ok(aids) => {
                tracing::info!(devices = ?aids, "inserted");
                Ok(aids)
            }
            Err(err) => {
                tracing::debug!(error = %err, "insert rolled back");
                self.rollback(journal, pool_snapshot);
                Err(err)
            }
        }
    }

    fn insert_tx(
        &mut self,
        mut device: DeviceNode,
        journal: &mut Vec<JournalOp>,
    ) -> Result<Vec<String>, InsertError> {
        // Fail fast on a duplicate symbolic id, before touching anything.
        if let Some(qid) = device.qid() {
            if self.devices.values().any(|d| d.qid() == Some(qid)) {
                return Err(InsertError::DuplicateId(qid.to_string()));
            }
        }

        let mut inserted = Vec::new();

        let reqs = device.parent_buses().to_vec();
        for req in &reqs {
            let (bus_id, addr) = self.satisfy_requirement(req, journal, &mut inserted)?;
            let dims = self
                .bus(&bus_id)
                .map(|b| {
                    b.space()
                        .shape()
                        .dims()
                        .iter()
                        .map(|(n, _)| n.clone())
                        .collect()
                })
                .unwrap_or_default();
            device.attachments_mut().push(crate::device::Attachment {
                bus_id,
                address: addr,
                dims,
            });
        }

        let aid = self.assign_alias(&device);
        device.set_aid(aid.clone());

        for child in device.child_buses().to_vec() {
            let existing: Vec<&str> = self.buses.iter().map(BusInstance::id).collect();
            let id = resolve_bus_name(&child.id_pattern, &existing);
            if self.bus_index(&id).is_some() {
                return Err(InsertError::DuplicateBus(id));
            }
            let mut bus = BusInstance::owned(&id, child.kind, &aid);
            if let Some(shape) = child.shape {
                bus = bus.with_shape(shape);
            }
            bus = bus.with_reserved(&child.reserved);
            tracing::debug!(bus = %id, owner = %aid, "child bus registered");
            self.buses.push(bus);
            journal.push(JournalOp::BusAdded { bus_id: id });
        }

        if let Some(want) = device.iothread_want().cloned() {
            if device.supports(DeviceFeature::IoThread) {
                if let Some(handle) = self.pool.request(want.name.as_deref())? {
                    device.params_mut().set("iothread", handle.id());
                    device.set_iothread(Some(handle));
                }
            } else {
                tracing::warn!(alias = %aid, "iothread requested by ineligible device");
            }
        }

        self.order.push(aid.clone());
        self.devices.insert(aid.clone(), device);
        journal.push(JournalOp::DeviceAdded { aid: aid.clone() });
        inserted.push(aid);
        Ok(inserted)
    }

    /// Finds a bus and slot for one requirement.
    ///
    /// Candidates are scanned in registration order. A wrong-kind
    /// permissive match is never taken while the scan may still find an
    /// exact-kind bus: the first such match promotes the rest of this
    /// requirement's search to strict, and the compatible bus is used only
    /// as the fallback once no exact-kind bus admits the device. Promotion
    /// is local to the requirement.
    fn satisfy_requirement(
        &mut self,
        req: &BusRequest,
        journal: &mut Vec<JournalOp>,
        inserted: &mut Vec<String>,
    ) -> Result<(String, Address), InsertError> {
        for _round in 0..MAX_EXPANSION_ROUNDS {
            let candidates: Vec<String> = self
                .buses
                .iter()
                .filter(|b| b.accepts(req, false))
                .map(|b| b.id().to_string())
                .collect();
            if candidates.is_empty() {
                return Err(InsertError::NoMatchingBus(req.clone()));
            }

            let mut fallback: Option<(String, Address)> = None;
            let mut expansion: Option<Vec<DeviceNode>> = None;
            let mut chosen: Option<(String, Address)> = None;

            for bus_id in &candidates {
                let Some(idx) = self.bus_index(bus_id) else {
                    continue;
                };
                let bus = &self.buses[idx];
                let exact = bus.kind() == req.kind;
                if req.strict_kind && !exact {
                    continue;
                }
                match bus.admit(req) {
                    Some(Admission::Slot(addr)) => {
                        if exact {
                            chosen = Some((bus_id.clone(), addr));
                            break;
                        }
                        if fallback.is_none() {
                            fallback = Some((bus_id.clone(), addr));
                        }
                    }
                    Some(Admission::Expand(devs)) => {
                        if expansion.is_none() {
                            expansion = Some(devs);
                        }
                    }
                    None => {}
                }
            }

            if let Some((bus_id, addr)) = chosen.or(fallback) {
                self.reserve_on(&bus_id, &addr, journal)?;
                return Ok((bus_id, addr));
            }

            if let Some(devs) = expansion {
                for aux in devs {
                    let sub = self.insert_tx(aux, journal)?;
                    inserted.extend(sub);
                }
                continue;
            }

            return Err(InsertError::NoFreeSlot(req.clone()));
        }
        Err(InsertError::ExpansionDiverged(req.clone()))
    }

    fn reserve_on(
        &mut self,
        bus_id: &str,
        addr: &Address,
        journal: &mut Vec<JournalOp>,
    ) -> Result<(), InsertError> {
        let Some(idx) = self.bus_index(bus_id) else {
            return Err(InsertError::NoMatchingBus(BusRequest::named(
                crate::bus::BusKind::Custom,
                bus_id,
            )));
        };
        if !self.buses[idx].space_mut().reserve(addr) {
            return Err(InsertError::NoFreeSlot(BusRequest::named(
                self.buses[idx].kind(),
                bus_id,
            )));
        }
        journal.push(JournalOp::Reserved {
            bus_id: bus_id.to_string(),
            addr: addr.clone(),
        });
        Ok(())
    }

    fn assign_alias(&self, device: &DeviceNode) -> String {
        let base = device.alias_base();
        if !self.devices.contains_key(&base) {
            return base;
        }
        let mut n = 0u32;
        loop {
            let candidate = format!("{base}__{n}");
            if !self.devices.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn rollback(&mut self, journal: Vec<JournalOp>, pool_snapshot: IoThreadPool) {
        for op in journal.into_iter().rev() {
            match op {
                JournalOp::Reserved { bus_id, addr } => {
                    if let Some(idx) = self.bus_index(&bus_id) {
                        self.buses[idx].space_mut().release(&addr);
                    }
                }
                JournalOp::BusAdded { bus_id } => {
                    self.buses.retain(|b| b.id() != bus_id);
                }
                JournalOp::DeviceAdded { aid } => {
                    self.devices.remove(&aid);
                    self.order.retain(|a| a != &aid);
                }
            }
        }
        self.pool = pool_snapshot;
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes a device, cascading to its exclusively-owned child buses and
    /// to every device attached to them, recursively.
    ///
    /// Returns the aliases removed, the requested device first.
    ///
    /// # Errors
    ///
    /// [`RemoveError::NotFound`] when no device has the alias.
    pub fn remove(&mut self, aid: &str) -> Result<Vec<String>, RemoveError> {
        if !self.devices.contains_key(aid) {
            return Err(RemoveError::NotFound(aid.to_string()));
        }

        let mut victims: Vec<String> = vec![aid.to_string()];
        let mut dying_buses: Vec<String> = Vec::new();
        let mut i = 0;
        while i < victims.len() {
            let owner = victims[i].clone();
            let owned: Vec<String> = self
                .buses
                .iter()
                .filter(|b| b.owner() == Some(owner.as_str()))
                .map(|b| b.id().to_string())
                .collect();
            for bus_id in owned {
                if dying_buses.contains(&bus_id) {
                    continue;
                }
                // insertion order keeps the cascade deterministic
                for daid in &self.order {
                    if victims.contains(daid) {
                        continue;
                    }
                    let attached = self
                        .devices
                        .get(daid)
                        .is_some_and(|d| d.attachments().iter().any(|a| a.bus_id == bus_id));
                    if attached {
                        victims.push(daid.clone());
                    }
                }
                dying_buses.push(bus_id);
            }
            i += 1;
        }

        for victim in &victims {
            let Some(dev) = self.devices.remove(victim) else {
                continue;
            };
            self.order.retain(|a| a != victim);

            for att in dev.attachments() {
                if dying_buses.contains(&att.bus_id) {
                    continue;
                }
                if let Some(idx) = self.bus_index(&att.bus_id) {
                    self.buses[idx].space_mut().release(&att.address);
                }
            }

            if let Some(handle) = dev.iothread() {
                self.pool.release(handle);
            }

            if let Some(parent) = dev.storage_parent().map(ToString::to_string) {
                if let Some(pd) = self.devices.get_mut(&parent) {
                    pd.unlink_storage_child(victim);
                }
            }
            for child in dev.storage_children().to_vec() {
                if let Some(cd) = self.devices.get_mut(&child) {
                    cd.set_storage_parent(None);
                }
            }
        }

        self.buses.retain(|b| !dying_buses.contains(&b.id().to_string()));
        tracing::info!(devices = ?victims, buses = ?dying_buses, "removed");
        Ok(victims)
    }

    /// The registry's I/O thread pool.
    #[must_use]
    pub const fn iothreads(&self) -> &IoThreadPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusKind, ChildBus};
    use gantry_capability::{CapabilitySet, Version};

    fn registry() -> TopologyRegistry {
        let mut reg = TopologyRegistry::new(CapabilitySet::bare(Version::new(&[5, 0])));
        reg.add_root_bus(BusInstance::root("pci.0", BusKind::Pci))
            .unwrap();
        reg
    }

    fn pci_dev(qid: &str) -> DeviceNode {
        DeviceNode::structured("e1000")
            .with_qid(qid)
            .with_parent_bus(BusRequest::kind(BusKind::Pci))
    }

    #[test]
    fn insert_assigns_slots_in_order() {
        let mut reg = registry();
        reg.insert(pci_dev("a")).unwrap();
        reg.insert(pci_dev("b")).unwrap();

        assert_eq!(
            reg.get("a").unwrap().attachments()[0].address,
            Address::slot(0)
        );
        assert_eq!(
            reg.get("b").unwrap().attachments()[0].address,
            Address::slot(1)
        );
    }

    #[test]
    fn duplicate_qid_fails_without_mutation() {
        let mut reg = registry();
        reg.insert(pci_dev("a")).unwrap();
        let before = reg.describe();
        let err = reg.insert(pci_dev("a")).unwrap_err();
        assert!(matches!(err, InsertError::DuplicateId(_)));
        assert_eq!(reg.describe(), before);
    }

    #[test]
    fn anonymous_aliases_get_suffixes() {
        let mut reg = registry();
        let dev = || DeviceNode::structured("e1000").with_parent_bus(BusRequest::kind(BusKind::Pci));
        let a = reg.insert(dev()).unwrap();
        let b = reg.insert(dev()).unwrap();
        assert_eq!(a, ["e1000"]);
        assert_eq!(b, ["e1000__0"]);
    }

    #[test]
    fn ide_request_falls_back_to_ahci() {
        let mut reg = registry();
        reg.add_root_bus(BusInstance::root("ahci.0", BusKind::Ahci))
            .unwrap();
        let aids = reg
            .insert(
                DeviceNode::structured("ide-hd")
                    .with_qid("disk")
                    .with_parent_bus(BusRequest::kind(BusKind::Ide)),
            )
            .unwrap();
        assert_eq!(aids, ["disk"]);
        assert_eq!(reg.get("disk").unwrap().attachments()[0].bus_id, "ahci.0");
    }

    #[test]
    fn exact_kind_bus_preferred_over_earlier_compatible() {
        let mut reg = registry();
        // ahci registered first, real ide bus second
        reg.add_root_bus(BusInstance::root("ahci.0", BusKind::Ahci))
            .unwrap();
        reg.add_root_bus(BusInstance::root("ide.0", BusKind::Ide))
            .unwrap();
        reg.insert(
            DeviceNode::structured("ide-hd")
                .with_qid("disk")
                .with_parent_bus(BusRequest::kind(BusKind::Ide)),
        )
        .unwrap();
        assert_eq!(reg.get("disk").unwrap().attachments()[0].bus_id, "ide.0");
    }

    #[test]
    fn strict_request_ignores_compatible_buses() {
        let mut reg = registry();
        reg.add_root_bus(BusInstance::root("ahci.0", BusKind::Ahci))
            .unwrap();
        let err = reg
            .insert(
                DeviceNode::structured("ide-hd")
                    .with_parent_bus(BusRequest::kind(BusKind::Ide).strict()),
            )
            .unwrap_err();
        assert!(matches!(err, InsertError::NoFreeSlot(_)));
    }

    #[test]
    fn controller_registers_child_bus_with_pattern_name() {
        let mut reg = registry();
        reg.insert(
            DeviceNode::controller("usb-ehci")
                .with_qid("usb1")
                .with_parent_bus(BusRequest::kind(BusKind::Pci))
                .with_child_bus(ChildBus::new("usb%d", BusKind::Usb)),
        )
        .unwrap();
        let bus = reg.bus("usb0").unwrap();
        assert_eq!(bus.kind(), BusKind::Usb);
        assert_eq!(bus.owner(), Some("usb1"));
    }

    #[test]
    fn failed_insert_rolls_back_auxiliaries() {
        let mut reg = registry();
        // Device needing a PCI slot and a SCSI bus; no SCSI bus exists, so
        // the PCI reservation must be rolled back.
        let before_reserved = reg.bus("pci.0").unwrap().space().reserved_count();
        let err = reg
            .insert(
                DeviceNode::structured("scsi-hd")
                    .with_parent_bus(BusRequest::kind(BusKind::Pci))
                    .with_parent_bus(BusRequest::kind(BusKind::Scsi)),
            )
            .unwrap_err();
        assert!(matches!(err, InsertError::NoMatchingBus(_)));
        assert_eq!(
            reg.bus("pci.0").unwrap().space().reserved_count(),
            before_reserved
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn pcie_endpoint_triggers_root_port_expansion() {
        let mut reg = TopologyRegistry::new(CapabilitySet::bare(Version::new(&[5, 0])));
        reg.add_root_bus(BusInstance::root("pcie.0", BusKind::PcieRoot))
            .unwrap();
        let aids = reg
            .insert(
                DeviceNode::structured("virtio-net")
                    .with_qid("net0")
                    .with_parent_bus(BusRequest::kind(BusKind::Pcie)),
            )
            .unwrap();
        assert_eq!(aids, ["pcie-root-port", "net0"]);
        let port_bus = reg.bus("pcie-port0").unwrap();
        assert_eq!(port_bus.kind(), BusKind::Pcie);
        assert_eq!(reg.get("net0").unwrap().attachments()[0].bus_id, "pcie-port0");
    }

    #[test]
    fn remove_cascades_through_child_buses() {
        let mut reg = registry();
        reg.insert(
            DeviceNode::controller("virtio-scsi")
                .with_qid("hba")
                .with_parent_bus(BusRequest::kind(BusKind::Pci))
                .with_child_bus(ChildBus::new("hba.0", BusKind::Scsi)),
        )
        .unwrap();
        reg.insert(
            DeviceNode::structured("scsi-hd")
                .with_qid("disk")
                .with_parent_bus(BusRequest::named(BusKind::Scsi, "hba.0")),
        )
        .unwrap();

        let removed = reg.remove("hba").unwrap();
        assert_eq!(removed, ["hba", "disk"]);
        assert!(reg.is_empty());
        assert!(reg.bus("hba.0").is_none());
        // the controller's pci slot is free again
        assert_eq!(reg.bus("pci.0").unwrap().space().reserved_count(), 0);
    }

    #[test]
    fn dirtiness_counter_discipline() {
        let mut reg = registry();
        assert_eq!(reg.dirtiness(), -1);
        reg.attach_live();
        assert_eq!(reg.dirtiness(), 0);
        reg.mark_dirty();
        reg.mark_dirty();
        assert_eq!(reg.dirtiness(), 2);
        reg.confirm();
        assert_eq!(reg.dirtiness(), 1);
        reg.confirm();
        reg.confirm();
        assert_eq!(reg.dirtiness(), 0);
    }

    #[test]
    fn address_hint_respected_or_refused() {
        let mut reg = registry();
        reg.insert(pci_dev("a")).unwrap();
        let pinned = DeviceNode::structured("e1000")
            .with_qid("b")
            .with_parent_bus(BusRequest::kind(BusKind::Pci).at(Address::slot(5)));
        reg.insert(pinned).unwrap();
        assert_eq!(
            reg.get("b").unwrap().attachments()[0].address,
            Address::slot(5)
        );

        let clash = DeviceNode::structured("e1000")
            .with_qid("c")
            .with_parent_bus(BusRequest::kind(BusKind::Pci).at(Address::slot(5)));
        assert!(matches!(
            reg.insert(clash).unwrap_err(),
            InsertError::NoFreeSlot(_)
        ));
    }
}
