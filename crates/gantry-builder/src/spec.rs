//! Declarative machine specification records.
//!
//! The schema itself is an external contract: callers hand in a plain tree
//! of key/value records, and builder functions translate each section into
//! device inserts. Every field defaults so partial specs stay valid.

use serde::{Deserialize, Serialize};

/// Full machine specification supplied at build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSpec {
    /// Root bus flavor.
    pub chipset: Chipset,
    /// I/O thread pooling configuration.
    pub iothreads: IoThreadSpec,
    /// Storage/USB controllers.
    pub controllers: Vec<ControllerSpec>,
    /// Disks.
    pub disks: Vec<DiskSpec>,
    /// Network devices.
    pub nics: Vec<NicSpec>,
    /// Serial consoles.
    pub serials: Vec<SerialSpec>,
    /// Extra raw fragments appended verbatim.
    pub fragments: Vec<String>,
}

/// Root bus flavor of the machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chipset {
    /// Conventional PCI root bus.
    #[default]
    Legacy,
    /// PCI Express root complex.
    PcieNative,
}

/// I/O thread pooling section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IoThreadSpec {
    /// Allocation scheme.
    pub scheme: IoThreadSchemeSpec,
    /// Thread names for the schemes that take a fixed list.
    pub threads: Vec<String>,
}

/// Allocation scheme selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoThreadSchemeSpec {
    /// No pooling.
    #[default]
    Disabled,
    /// Devices name their thread explicitly.
    Predefined,
    /// Cycle through the configured list.
    RoundRobin,
    /// Fresh thread per eligible device.
    PerDevice,
}

/// One controller record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSpec {
    /// Symbolic id; child buses are named `<id>.0`.
    pub id: String,
    /// Controller family.
    pub kind: ControllerKind,
    /// Explicit I/O thread name.
    #[serde(default)]
    pub iothread: Option<String>,
}

/// Controller family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    /// SCSI HBA.
    Scsi,
    /// AHCI SATA controller.
    Ahci,
    /// USB host controller.
    Usb,
}

/// One disk record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Symbolic id of the disk frontend.
    pub id: String,
    /// Backing image path.
    pub path: String,
    /// On-disk format.
    #[serde(default)]
    pub format: DiskFormat,
    /// Controller id to attach to; a missing controller is auto-created.
    /// Absent means a bus-addressed virtio disk on the root bus.
    #[serde(default)]
    pub bus: Option<String>,
    /// Attach read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Explicit I/O thread name.
    #[serde(default)]
    pub iothread: Option<String>,
    /// Serve the backend from an external storage daemon.
    #[serde(default)]
    pub daemon: bool,
}

/// On-disk image format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFormat {
    /// Flat image.
    #[default]
    Raw,
    /// Copy-on-write image.
    Qcow2,
}

impl DiskFormat {
    /// Driver name of the format layer.
    #[must_use]
    pub const fn driver(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
        }
    }
}

/// One network device record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicSpec {
    /// Symbolic id.
    pub id: String,
    /// Device model driver.
    #[serde(default = "default_nic_model")]
    pub model: String,
    /// MAC address override.
    #[serde(default)]
    pub mac: Option<String>,
}

fn default_nic_model() -> String {
    "virtio-net-pci".to_string()
}

/// One serial console record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSpec {
    /// Symbolic id of the console port.
    pub id: String,
}
