//! Builder functions: specification records to topology inserts.
//!
//! Every encoding decision here is capability-gated through the snapshot —
//! the builder never branches on raw version numbers and never probes by
//! error. A request for a feature the target build lacks surfaces as a
//! construction-time [`BuilderError::Unsupported`], not as a runtime
//! failure from the live process.

use gantry_capability::{Capability, CapabilitySet};
use gantry_topology::{
    BusInstance, BusKind, BusRequest, ChildBus, DeviceNode, TopologyRegistry,
};
use gantry_topology::iothread::IoThreadScheme;

use crate::error::BuilderError;
use crate::spec::{
    Chipset, ControllerKind, ControllerSpec, DiskSpec, IoThreadSchemeSpec, MachineSpec, NicSpec,
    SerialSpec,
};

/// Translates [`MachineSpec`] trees into populated registries.
#[derive(Debug, Clone)]
pub struct MachineBuilder {
    caps: CapabilitySet,
}

impl MachineBuilder {
    /// Binds the builder to one capability snapshot.
    #[must_use]
    pub const fn new(caps: CapabilitySet) -> Self {
        Self { caps }
    }

    /// The bound snapshot.
    #[must_use]
    pub const fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    /// Builds the full topology for a specification.
    ///
    /// Devices are inserted section by section in spec order, so the
    /// serialized output is deterministic for equal inputs.
    ///
    /// # Errors
    ///
    /// [`BuilderError::Unsupported`] for capability mismatches,
    /// [`BuilderError::Insert`] for topology failures.
    pub fn build(&self, spec: &MachineSpec) -> Result<TopologyRegistry, BuilderError> {
        let scheme = self.iothread_scheme(spec)?;
        let mut reg = TopologyRegistry::with_iothread_scheme(self.caps.clone(), scheme);

        match spec.chipset {
            Chipset::Legacy => {
                reg.add_root_bus(BusInstance::root("pci.0", BusKind::Pci))?;
            }
            Chipset::PcieNative => {
                if !self.caps.supports(Capability::PcieRootPort) {
                    return Err(BuilderError::Unsupported(Capability::PcieRootPort));
                }
                reg.add_root_bus(BusInstance::root("pcie.0", BusKind::PcieRoot))?;
            }
        }

        for c in &spec.controllers {
            let dev = self.controller_device(c, spec)?;
            reg.insert(dev)?;
        }
        for d in &spec.disks {
            for dev in self.disk_devices(&reg, d, spec)? {
                reg.insert(dev)?;
            }
        }
        for n in &spec.nics {
            reg.insert(Self::nic_device(n))?;
        }
        for s in &spec.serials {
            for dev in Self::serial_devices(s) {
                reg.insert(dev)?;
            }
        }
        for f in &spec.fragments {
            let words: Vec<&str> = f.split_whitespace().collect();
            if !words.is_empty() {
                reg.insert(DeviceNode::raw(&words))?;
            }
        }

        tracing::info!(devices = reg.len(), "machine topology built");
        Ok(reg)
    }

    /// Resolves the pool scheme, gating any I/O thread use on the
    /// capability snapshot. A named thread under a disabled scheme means
    /// the caller wants predefined pooling.
    fn iothread_scheme(&self, spec: &MachineSpec) -> Result<IoThreadScheme, BuilderError> {
        let named = spec.controllers.iter().any(|c| c.iothread.is_some())
            || spec.disks.iter().any(|d| d.iothread.is_some());
        let wants = named || spec.iothreads.scheme != IoThreadSchemeSpec::Disabled;
        if wants && !self.caps.supports(Capability::IoThread) {
            return Err(BuilderError::Unsupported(Capability::IoThread));
        }
        Ok(match spec.iothreads.scheme {
            IoThreadSchemeSpec::Disabled => {
                if named {
                    IoThreadScheme::Predefined
                } else {
                    IoThreadScheme::Disabled
                }
            }
            IoThreadSchemeSpec::Predefined => IoThreadScheme::Predefined,
            IoThreadSchemeSpec::RoundRobin => {
                IoThreadScheme::RoundRobin(spec.iothreads.threads.clone())
            }
            IoThreadSchemeSpec::PerDevice => IoThreadScheme::PerDevice,
        })
    }

    const fn auto_iothread(spec: &MachineSpec) -> bool {
        matches!(
            spec.iothreads.scheme,
            IoThreadSchemeSpec::RoundRobin | IoThreadSchemeSpec::PerDevice
        )
    }

    fn controller_device(
        &self,
        c: &ControllerSpec,
        spec: &MachineSpec,
    ) -> Result<DeviceNode, BuilderError> {
        let bus_name = format!("{}.0", c.id);
        let mut dev = match c.kind {
            ControllerKind::Scsi => DeviceNode::controller("virtio-scsi-pci")
                .with_child_bus(ChildBus::new(bus_name, BusKind::Scsi)),
            ControllerKind::Ahci => {
                if !self.caps.supports(Capability::Ahci) {
                    return Err(BuilderError::Unsupported(Capability::Ahci));
                }
                DeviceNode::controller("ahci").with_child_bus(ChildBus::new(bus_name, BusKind::Ahci))
            }
            ControllerKind::Usb => DeviceNode::controller("usb-ehci")
                .with_child_bus(ChildBus::new(bus_name, BusKind::Usb)),
        };
        dev = dev
            .with_qid(&c.id)
            .with_parent_bus(BusRequest::kind(BusKind::Pci));

        if c.iothread.is_some() || (c.kind == ControllerKind::Scsi && Self::auto_iothread(spec)) {
            dev = dev.with_iothread(c.iothread.clone());
        }
        Ok(dev)
    }

    /// Devices for one disk record, in insert order: an auto-created HBA
    /// when the named controller is missing, then the storage encoding
    /// (legacy drive fragment or protocol/format node chain), then the
    /// frontend.
    fn disk_devices(
        &self,
        reg: &TopologyRegistry,
        d: &DiskSpec,
        spec: &MachineSpec,
    ) -> Result<Vec<DeviceNode>, BuilderError> {
        if d.daemon {
            return self.daemon_disk_devices(d);
        }

        let mut out = Vec::new();

        let (front_req, front_driver) = match &d.bus {
            Some(hba) => {
                let bus_name = format!("{hba}.0");
                let kind = match reg.bus(&bus_name) {
                    Some(bus) => bus.kind(),
                    None => {
                        out.push(
                            DeviceNode::controller("virtio-scsi-pci")
                                .with_qid(hba)
                                .with_parent_bus(BusRequest::kind(BusKind::Pci))
                                .with_child_bus(ChildBus::new(&bus_name, BusKind::Scsi)),
                        );
                        BusKind::Scsi
                    }
                };
                let driver = match kind {
                    BusKind::Ahci | BusKind::Ide => "ide-hd",
                    BusKind::Usb => "usb-storage",
                    _ => "scsi-hd",
                };
                (BusRequest::named(kind, bus_name), driver)
            }
            None => (BusRequest::kind(BusKind::Pci), "virtio-blk-pci"),
        };

        let backing_ref = if self.caps.supports(Capability::ModernStorage) {
            let proto_name = format!("proto-{}", d.id);
            let fmt_name = format!("fmt-{}", d.id);

            let mut proto = DeviceNode::protocol_node(&proto_name, "file")
                .with_qid(&proto_name)
                .with_storage_parent(&fmt_name)
                .with_param("filename", d.path.as_str());
            if d.readonly {
                proto = proto.with_param("read-only", true);
            }
            let fmt = DeviceNode::format_node(&fmt_name, d.format.driver())
                .with_qid(&fmt_name)
                .with_storage_child(&proto_name)
                .with_param("file", proto_name.as_str());

            out.push(proto);
            out.push(fmt);
            fmt_name
        } else {
            let drive_id = format!("drive-{}", d.id);
            let mut fragment = format!(
                "file={},format={},if=none,id={}",
                d.path,
                d.format.driver(),
                drive_id
            );
            if d.readonly {
                fragment.push_str(",readonly=on");
            }
            out.push(DeviceNode::raw(&["-drive", fragment.as_str()]).with_qid(&drive_id));
            drive_id
        };

        let mut front = DeviceNode::structured(front_driver)
            .with_qid(&d.id)
            .with_parent_bus(front_req)
            .with_param("drive", backing_ref.as_str());
        if d.iothread.is_some() || (front_driver == "virtio-blk-pci" && Self::auto_iothread(spec)) {
            front = front.with_iothread(d.iothread.clone());
        }
        out.push(front);
        Ok(out)
    }

    /// Daemon-served disk: an external backend process plus a socket-backed
    /// frontend. No storage nodes — the daemon owns the image.
    fn daemon_disk_devices(&self, d: &DiskSpec) -> Result<Vec<DeviceNode>, BuilderError> {
        if !self.caps.supports(Capability::DaemonStorage) {
            return Err(BuilderError::Unsupported(Capability::DaemonStorage));
        }
        let socket = format!("{}.sock", d.id);
        let mut argv_owned = vec![
            "storage-daemon".to_string(),
            format!("--image={}", d.path),
            format!("--format={}", d.format.driver()),
            format!("--socket={socket}"),
        ];
        if d.readonly {
            argv_owned.push("--read-only".to_string());
        }
        let argv: Vec<&str> = argv_owned.iter().map(String::as_str).collect();

        let daemon = DeviceNode::daemon(&argv).with_qid(format!("{}-daemon", d.id));
        let front = DeviceNode::structured("vhost-user-blk-pci")
            .with_qid(&d.id)
            .with_parent_bus(BusRequest::kind(BusKind::Pci))
            .with_param("socket", socket.as_str());
        Ok(vec![daemon, front])
    }

    fn nic_device(n: &NicSpec) -> DeviceNode {
        let mut dev = DeviceNode::structured(n.model.as_str())
            .with_qid(&n.id)
            .with_parent_bus(BusRequest::kind(BusKind::Pci));
        if let Some(mac) = &n.mac {
            dev = dev.with_param("mac", mac.as_str());
        }
        dev
    }

    fn serial_devices(s: &SerialSpec) -> Vec<DeviceNode> {
        let bus_name = format!("{}.0", s.id);
        let ctl = DeviceNode::controller("virtio-serial-pci")
            .with_qid(format!("{}-ctl", s.id))
            .with_parent_bus(BusRequest::kind(BusKind::Pci))
            .with_child_bus(ChildBus::new(&bus_name, BusKind::Serial));
        let port = DeviceNode::structured("virtconsole")
            .with_qid(&s.id)
            .with_parent_bus(BusRequest::named(BusKind::Serial, bus_name));
        vec![ctl, port]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_capability::Version;

    fn spec_with_disk(bus: Option<&str>) -> MachineSpec {
        MachineSpec {
            disks: vec![DiskSpec {
                id: "disk0".into(),
                path: "/img/root.img".into(),
                format: crate::spec::DiskFormat::Qcow2,
                bus: bus.map(ToString::to_string),
                readonly: false,
                iothread: None,
                daemon: false,
            }],
            ..MachineSpec::default()
        }
    }

    #[test]
    fn legacy_storage_uses_drive_fragment() {
        let builder = MachineBuilder::new(CapabilitySet::bare(Version::new(&[2, 0])));
        let reg = builder.build(&spec_with_disk(None)).unwrap();
        assert!(reg.get_by_qid("drive-disk0").is_some());
        assert!(reg.get_by_qid("fmt-disk0").is_none());
    }

    #[test]
    fn modern_storage_builds_node_chain() {
        let builder = MachineBuilder::new(CapabilitySet::new(
            Version::new(&[5, 0]),
            [Capability::ModernStorage],
        ));
        let reg = builder.build(&spec_with_disk(None)).unwrap();
        let fmt = reg.get_by_qid("fmt-disk0").unwrap();
        assert_eq!(fmt.storage_children(), ["proto-disk0"]);
        assert_eq!(
            reg.get_by_qid("proto-disk0").unwrap().storage_parent(),
            Some("fmt-disk0")
        );
    }

    #[test]
    fn missing_hba_is_auto_created() {
        let builder = MachineBuilder::new(CapabilitySet::bare(Version::new(&[2, 0])));
        let reg = builder.build(&spec_with_disk(Some("hba1"))).unwrap();
        assert!(reg.get_by_qid("hba1").is_some());
        let bus = reg.bus("hba1.0").unwrap();
        assert_eq!(bus.kind(), BusKind::Scsi);
    }

    #[test]
    fn iothread_without_capability_is_rejected() {
        let builder = MachineBuilder::new(CapabilitySet::bare(Version::new(&[2, 0])));
        let mut spec = spec_with_disk(None);
        spec.disks[0].iothread = Some("io0".into());
        let err = builder.build(&spec).unwrap_err();
        assert!(matches!(
            err,
            BuilderError::Unsupported(Capability::IoThread)
        ));
    }

    #[test]
    fn daemon_disk_requires_capability() {
        let builder = MachineBuilder::new(CapabilitySet::bare(Version::new(&[2, 0])));
        let mut spec = spec_with_disk(None);
        spec.disks[0].daemon = true;
        assert!(matches!(
            builder.build(&spec).unwrap_err(),
            BuilderError::Unsupported(Capability::DaemonStorage)
        ));
    }
}
