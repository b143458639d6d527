//! Bus model: addressable attachment points with allocation policies.
//!
//! Buses are a closed kind enumeration dispatched exhaustively — a new bus
//! family extends [`BusKind`], never an ad-hoc attribute probe. Matching is
//! two-tier: permissive (kind compatibility, e.g. an IDE-flavored request
//! satisfied by an AHCI bus) and strict (exact kind).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressShape, AddressSpace};
use crate::device::DeviceNode;

/// Closed bus kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusKind {
    /// Conventional PCI, linear slot addressing.
    Pci,
    /// PCI Express root complex.
    PcieRoot,
    /// PCI Express downstream port (one slot per root port).
    Pcie,
    /// Legacy IDE, bus/unit addressing.
    Ide,
    /// AHCI SATA, unit addressing; satisfies IDE-flavored requests.
    Ahci,
    /// SCSI, id/lun addressing.
    Scsi,
    /// USB ports.
    Usb,
    /// Serial/console ports.
    Serial,
    /// Caller-shaped bus.
    Custom,
}

impl BusKind {
    /// Stable name used in ids, logs, and emitted parameters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pci => "pci",
            Self::PcieRoot => "pcie-root",
            Self::Pcie => "pcie",
            Self::Ide => "ide",
            Self::Ahci => "ahci",
            Self::Scsi => "scsi",
            Self::Usb => "usb",
            Self::Serial => "serial",
            Self::Custom => "custom",
        }
    }

    /// The default address shape for the kind.
    #[must_use]
    pub fn default_shape(self) -> AddressShape {
        match self {
            Self::Pci | Self::PcieRoot => AddressShape::linear("addr", 32),
            Self::Pcie => AddressShape::linear("addr", 1),
            Self::Ide => AddressShape::new(&[("bus", 2), ("unit", 2)]),
            Self::Ahci => AddressShape::linear("unit", 6),
            Self::Scsi => AddressShape::new(&[("scsi-id", 8), ("lun", 4)]),
            Self::Usb => AddressShape::linear("port", 6),
            Self::Serial => AddressShape::linear("nr", 30),
            Self::Custom => AddressShape::linear("idx", 64),
        }
    }

    /// Permissive compatibility: can a bus of kind `self` satisfy a request
    /// for `requested`? Exact matches always qualify; beyond that, AHCI
    /// serves IDE-flavored requests and the PCI Express kinds serve
    /// conventional PCI requests. A root complex is also a permissive
    /// candidate for PCIe endpoint requests — admission then goes through
    /// root-port expansion rather than a direct slot.
    #[must_use]
    pub fn satisfies(self, requested: Self) -> bool {
        if self == requested {
            return true;
        }
        matches!(
            (self, requested),
            (Self::Ahci, Self::Ide)
                | (Self::PcieRoot | Self::Pcie, Self::Pci)
                | (Self::PcieRoot, Self::Pcie)
        )
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parent-bus requirement declared by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRequest {
    /// Requested bus kind.
    pub kind: BusKind,
    /// Specific bus id, when the device must land on a named bus.
    pub name: Option<String>,
    /// Address hint; a taken hint fails the requirement rather than
    /// relocating the device.
    pub address: Option<Address>,
    /// Require an exact kind match from the start.
    pub strict_kind: bool,
}

impl BusRequest {
    /// Requirement for any bus of the kind.
    #[must_use]
    pub const fn kind(kind: BusKind) -> Self {
        Self {
            kind,
            name: None,
            address: None,
            strict_kind: false,
        }
    }

    /// Requirement for a specific named bus.
    #[must_use]
    pub fn named(kind: BusKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: Some(name.into()),
            address: None,
            strict_kind: false,
        }
    }

    /// Pins the address.
    #[must_use]
    pub fn at(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Requires exact kind matching from the start.
    #[must_use]
    pub const fn strict(mut self) -> Self {
        self.strict_kind = true;
        self
    }
}

impl fmt::Display for BusRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind={}", self.kind)?;
        if let Some(name) = &self.name {
            write!(f, " name={name}")?;
        }
        if let Some(addr) = &self.address {
            write!(f, " addr={addr}")?;
        }
        if self.strict_kind {
            write!(f, " strict")?;
        }
        Ok(())
    }
}

/// Template for a child bus a device creates on successful insertion.
///
/// `id_pattern` may contain `%d`; the registry resolves it to the lowest
/// unused index among existing bus ids at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildBus {
    /// Bus id or `%d` pattern.
    pub id_pattern: String,
    /// Kind of the created bus.
    pub kind: BusKind,
    /// Shape override; the kind's default shape when absent.
    pub shape: Option<AddressShape>,
    /// Addresses the owning device keeps for itself (e.g. the control slot
    /// of a bridge), never handed out to attached devices.
    pub reserved: Vec<Address>,
}

impl ChildBus {
    /// Child bus with the kind's default shape.
    #[must_use]
    pub fn new(id_pattern: impl Into<String>, kind: BusKind) -> Self {
        Self {
            id_pattern: id_pattern.into(),
            kind,
            shape: None,
            reserved: Vec::new(),
        }
    }

    /// Child bus with an explicit shape.
    #[must_use]
    pub fn shaped(id_pattern: impl Into<String>, kind: BusKind, shape: AddressShape) -> Self {
        Self {
            id_pattern: id_pattern.into(),
            kind,
            shape: Some(shape),
            reserved: Vec::new(),
        }
    }

    /// Seeds owner-reserved addresses.
    #[must_use]
    pub fn with_reserved(mut self, addrs: &[Address]) -> Self {
        self.reserved.extend_from_slice(addrs);
        self
    }
}

/// Resolves a `%d` pattern to the lowest unused index among existing ids.
/// Literal names pass through unchanged.
#[must_use]
pub fn resolve_bus_name(pattern: &str, existing: &[&str]) -> String {
    if !pattern.contains("%d") {
        return pattern.to_string();
    }
    for n in 0u32.. {
        let candidate = pattern.replace("%d", &n.to_string());
        if !existing.contains(&candidate.as_str()) {
            return candidate;
        }
    }
    unreachable!("u32 index space exhausted");
}

/// Result of asking a bus to admit a device for one requirement.
#[derive(Debug)]
pub enum Admission {
    /// A concrete free slot.
    Slot(Address),
    /// Auxiliary devices must be inserted first; the requirement search is
    /// then re-run against the expanded bus list.
    Expand(Vec<DeviceNode>),
}

/// An addressable attachment point owned by exactly one device (or by the
/// implicit machine root when `owner` is absent).
#[derive(Debug, Clone)]
pub struct BusInstance {
    id: String,
    kind: BusKind,
    owner: Option<String>,
    space: AddressSpace,
}

impl BusInstance {
    /// Creates a root bus (no owning device) with the kind's default shape.
    #[must_use]
    pub fn root(id: impl Into<String>, kind: BusKind) -> Self {
        Self {
            id: id.into(),
            kind,
            owner: None,
            space: AddressSpace::new(kind.default_shape()),
        }
    }

    /// Creates a bus owned by a device.
    #[must_use]
    pub fn owned(id: impl Into<String>, kind: BusKind, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            owner: Some(owner.into()),
            space: AddressSpace::new(kind.default_shape()),
        }
    }

    /// Replaces the address shape.
    #[must_use]
    pub fn with_shape(mut self, shape: AddressShape) -> Self {
        self.space = AddressSpace::new(shape);
        self
    }

    /// Seeds reservations the bus keeps for itself; out-of-range seeds are
    /// ignored.
    #[must_use]
    pub fn with_reserved(mut self, addrs: &[Address]) -> Self {
        for addr in addrs {
            let _ = self.space.reserve(addr);
        }
        self
    }

    /// Bus id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bus kind.
    #[must_use]
    pub const fn kind(&self) -> BusKind {
        self.kind
    }

    /// Alias of the owning device, when not a machine root bus.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Reservation state.
    #[must_use]
    pub const fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Mutable reservation state (registry-internal).
    pub(crate) fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    /// Does this bus match a parent-bus request? `type_match` demands the
    /// exact kind; otherwise permissive compatibility applies. A named
    /// request additionally pins the bus id.
    #[must_use]
    pub fn accepts(&self, req: &BusRequest, type_match: bool) -> bool {
        let kind_ok = if type_match {
            self.kind == req.kind
        } else {
            self.kind.satisfies(req.kind)
        };
        let name_ok = req.name.as_deref().is_none_or(|n| n == self.id);
        kind_ok && name_ok
    }

    /// Asks the bus to admit a device under one requirement.
    ///
    /// A root complex asked for a PCIe endpoint slot answers with a
    /// root-port expansion: the port device must be inserted first, after
    /// which the re-run search finds the port's one-slot child bus. All
    /// other kinds answer with a free slot or nothing.
    #[must_use]
    pub fn admit(&self, req: &BusRequest) -> Option<Admission> {
        if self.kind == BusKind::PcieRoot && req.kind == BusKind::Pcie {
            return Some(Admission::Expand(vec![DeviceNode::root_port(&self.id)]));
        }
        self.space
            .free_slot(req.address.as_ref())
            .map(Admission::Slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_permissive_matching() {
        let ahci = BusInstance::root("ahci.0", BusKind::Ahci);
        let ide_req = BusRequest::kind(BusKind::Ide);

        assert!(ahci.accepts(&ide_req, false));
        assert!(!ahci.accepts(&ide_req, true));
        assert!(ahci.accepts(&BusRequest::kind(BusKind::Ahci), true));
    }

    #[test]
    fn named_request_pins_bus_id() {
        let bus = BusInstance::root("scsi0.0", BusKind::Scsi);
        assert!(bus.accepts(&BusRequest::named(BusKind::Scsi, "scsi0.0"), true));
        assert!(!bus.accepts(&BusRequest::named(BusKind::Scsi, "scsi1.0"), true));
    }

    #[test]
    fn pattern_name_takes_lowest_free_index() {
        assert_eq!(resolve_bus_name("usb%d", &[]), "usb0");
        assert_eq!(resolve_bus_name("usb%d", &["usb0", "usb2"]), "usb1");
        assert_eq!(resolve_bus_name("ide.1", &["ide.1"]), "ide.1");
    }

    #[test]
    fn root_complex_expands_for_pcie_endpoints() {
        let root = BusInstance::root("pcie.0", BusKind::PcieRoot);
        match root.admit(&BusRequest::kind(BusKind::Pcie)) {
            Some(Admission::Expand(devs)) => assert_eq!(devs.len(), 1),
            other => panic!("expected expansion, got {other:?}"),
        }
    }

    #[test]
    fn plain_bus_admits_first_free_slot() {
        let pci = BusInstance::root("pci.0", BusKind::Pci);
        match pci.admit(&BusRequest::kind(BusKind::Pci)) {
            Some(Admission::Slot(addr)) => assert_eq!(addr, Address::slot(0)),
            other => panic!("expected slot, got {other:?}"),
        }
    }
}
