//! Integration tests for specification translation and serialization.

use gantry_builder::emit;
use gantry_builder::{
    Chipset, ControllerKind, ControllerSpec, DiskFormat, DiskSpec, IoThreadSchemeSpec,
    IoThreadSpec, MachineBuilder, MachineSpec, NicSpec, SerialSpec,
};
use gantry_capability::{Capability, CapabilitySet, Version};
use gantry_topology::Address;

fn disk(id: &str, bus: Option<&str>) -> DiskSpec {
    DiskSpec {
        id: id.into(),
        path: format!("/img/{id}.qcow2"),
        format: DiskFormat::Qcow2,
        bus: bus.map(ToString::to_string),
        readonly: false,
        iothread: None,
        daemon: false,
    }
}

fn legacy_caps() -> CapabilitySet {
    CapabilitySet::bare(Version::new(&[2, 0]))
}

fn modern_caps() -> CapabilitySet {
    CapabilitySet::new(
        Version::new(&[5, 0]),
        [
            Capability::ModernStorage,
            Capability::IoThread,
            Capability::Ahci,
            Capability::PcieRootPort,
            Capability::DaemonStorage,
        ],
    )
}

// ============================================================================
// Auto-created controllers
// ============================================================================

#[test]
fn disk_on_missing_hba_auto_creates_controller_and_bus() {
    let spec = MachineSpec {
        disks: vec![disk("disk0", Some("hba1"))],
        ..MachineSpec::default()
    };
    let reg = MachineBuilder::new(legacy_caps()).build(&spec).unwrap();

    // the HBA and its bus exist even though the spec never declared them
    let hba = reg.get_by_qid("hba1").unwrap();
    assert_eq!(hba.driver(), Some("virtio-scsi-pci"));
    assert!(reg.bus("hba1.0").is_some());

    // the disk landed on the first coordinate of the fresh bus
    let att = &reg.get_by_qid("disk0").unwrap().attachments()[0];
    assert_eq!(att.bus_id, "hba1.0");
    assert_eq!(att.address, Address::new(&[0, 0]));
}

#[test]
fn declared_controller_is_reused_not_duplicated() {
    let spec = MachineSpec {
        controllers: vec![ControllerSpec {
            id: "hba1".into(),
            kind: ControllerKind::Scsi,
            iothread: None,
        }],
        disks: vec![disk("disk0", Some("hba1")), disk("disk1", Some("hba1"))],
        ..MachineSpec::default()
    };
    let reg = MachineBuilder::new(legacy_caps()).build(&spec).unwrap();

    let hbas: Vec<_> = reg
        .devices()
        .filter(|d| d.driver() == Some("virtio-scsi-pci"))
        .collect();
    assert_eq!(hbas.len(), 1);
    assert_eq!(
        reg.get_by_qid("disk1").unwrap().attachments()[0].address,
        Address::new(&[0, 1])
    );
}

// ============================================================================
// Capability-gated encodings
// ============================================================================

#[test]
fn storage_encoding_follows_capability_flag() {
    let spec = MachineSpec {
        disks: vec![disk("disk0", None)],
        ..MachineSpec::default()
    };

    let legacy = MachineBuilder::new(legacy_caps()).build(&spec).unwrap();
    let legacy_line = emit::command_line(&legacy);
    assert!(legacy_line.contains("-drive"));
    assert!(emit::node_graph(&legacy).is_empty());

    let modern = MachineBuilder::new(modern_caps()).build(&spec).unwrap();
    let modern_line = emit::command_line(&modern);
    assert!(modern_line.contains("-blockdev"));
    assert!(!modern_line.contains("-drive "));

    let graph = emit::node_graph(&modern);
    assert_eq!(graph.len(), 2);
    let fmt = graph.get("fmt-disk0").unwrap();
    assert_eq!(fmt["driver"], "qcow2");
    assert_eq!(fmt["children"][0], "proto-disk0");
}

#[test]
fn builds_are_byte_for_byte_deterministic() {
    let spec = MachineSpec {
        controllers: vec![ControllerSpec {
            id: "hba1".into(),
            kind: ControllerKind::Scsi,
            iothread: None,
        }],
        disks: vec![disk("disk0", Some("hba1")), disk("disk1", None)],
        nics: vec![NicSpec {
            id: "net0".into(),
            model: "virtio-net-pci".into(),
            mac: Some("52:54:00:aa:bb:cc".into()),
        }],
        serials: vec![SerialSpec { id: "console0".into() }],
        fragments: vec!["-display none".into()],
        ..MachineSpec::default()
    };

    for caps in [legacy_caps(), modern_caps()] {
        let a = MachineBuilder::new(caps.clone()).build(&spec).unwrap();
        let b = MachineBuilder::new(caps).build(&spec).unwrap();
        assert_eq!(emit::command_line(&a), emit::command_line(&b));
        assert_eq!(emit::node_graph(&a).to_json(), emit::node_graph(&b).to_json());
        assert_eq!(emit::daemon_commands(&a), emit::daemon_commands(&b));
    }
}

#[test]
fn daemon_disks_emit_an_external_invocation() {
    let mut d = disk("disk0", None);
    d.daemon = true;
    let spec = MachineSpec {
        disks: vec![d],
        ..MachineSpec::default()
    };
    let reg = MachineBuilder::new(modern_caps()).build(&spec).unwrap();

    let daemons = emit::daemon_commands(&reg);
    assert_eq!(daemons.len(), 1);
    assert!(daemons[0].starts_with("storage-daemon"));
    assert!(daemons[0].contains("--image=/img/disk0.qcow2"));

    // the frontend is a socket device, not a node chain
    assert!(emit::node_graph(&reg).is_empty());
    assert!(reg.get_by_qid("disk0").is_some());
}

#[test]
fn pcie_chipset_needs_the_capability() {
    let spec = MachineSpec {
        chipset: Chipset::PcieNative,
        ..MachineSpec::default()
    };
    assert!(MachineBuilder::new(legacy_caps()).build(&spec).is_err());
    assert!(MachineBuilder::new(modern_caps()).build(&spec).is_ok());
}

// ============================================================================
// I/O threads
// ============================================================================

#[test]
fn round_robin_iothreads_spread_over_the_pool() {
    let spec = MachineSpec {
        iothreads: IoThreadSpec {
            scheme: IoThreadSchemeSpec::RoundRobin,
            threads: vec!["io0".into(), "io1".into()],
        },
        disks: vec![disk("disk0", None), disk("disk1", None), disk("disk2", None)],
        ..MachineSpec::default()
    };
    let reg = MachineBuilder::new(modern_caps()).build(&spec).unwrap();

    let thread_of = |qid: &str| {
        reg.get_by_qid(qid)
            .and_then(|d| d.iothread())
            .map(|h| h.id().to_string())
    };
    assert_eq!(thread_of("disk0").as_deref(), Some("io0"));
    assert_eq!(thread_of("disk1").as_deref(), Some("io1"));
    assert_eq!(thread_of("disk2").as_deref(), Some("io0"));

    // serialized as shared objects, once each
    let line = emit::command_line(&reg);
    assert_eq!(line.matches("iothread,id=io0").count(), 1);
    assert_eq!(line.matches("iothread,id=io1").count(), 1);
}

#[test]
fn serial_console_gets_its_own_bus() {
    let spec = MachineSpec {
        serials: vec![SerialSpec { id: "console0".into() }],
        ..MachineSpec::default()
    };
    let reg = MachineBuilder::new(legacy_caps()).build(&spec).unwrap();

    assert!(reg.bus("console0.0").is_some());
    let port = reg.get_by_qid("console0").unwrap();
    assert_eq!(port.attachments()[0].bus_id, "console0.0");
}
