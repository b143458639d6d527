//! Command/topology serialization.
//!
//! Walks the ordered device list exactly once and emits either the linear
//! fragment sequence (legacy mode) or the storage node graph keyed by
//! generated node names (structured mode). Output is byte-for-byte
//! deterministic for equal inputs: device order is insertion order,
//! parameter order is name order, and JSON maps are sorted.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::device::{DeviceBody, DeviceNode};
use crate::params::ParamValue;
use crate::registry::TopologyRegistry;

/// The two-tier protocol/format node graph, keyed by generated node names.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeGraph {
    nodes: BTreeMap<String, Value>,
}

impl NodeGraph {
    /// Node definition by name.
    #[must_use]
    pub fn get(&self, node: &str) -> Option<&Value> {
        self.nodes.get(node)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Canonical JSON rendering.
    ///
    /// # Panics
    ///
    /// Never: the graph is built from JSON-native values only.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.nodes).unwrap_or_default()
    }
}

fn param_value_json(value: &ParamValue) -> Value {
    match value {
        ParamValue::Str(s) | ParamValue::Symbol(s) => Value::String(s.clone()),
        ParamValue::Int(i) => Value::from(*i),
        ParamValue::Bool(b) => Value::from(*b),
        ParamValue::Hex(h) => Value::from(*h),
    }
}

fn device_fragment(dev: &DeviceNode, driver: &str) -> String {
    let mut props = vec![driver.to_string()];
    if let Some(aid) = dev.aid() {
        props.push(format!("id={aid}"));
    }
    if let Some(att) = dev.attachments().first() {
        props.push(format!("bus={}", att.bus_id));
        for (dim, coord) in att.dims.iter().zip(att.address.coords()) {
            props.push(format!("{dim}={coord:#x}"));
        }
    }
    props.extend(dev.params().render_pairs());
    props.join(",")
}

fn node_definition(dev: &DeviceNode) -> Option<(String, Value)> {
    match dev.body() {
        DeviceBody::ProtocolNode { node, driver, .. } => {
            let mut def = Map::new();
            def.insert("driver".into(), Value::String(driver.clone()));
            def.insert("node-name".into(), Value::String(node.clone()));
            for (name, value) in dev.params().iter() {
                def.insert(name.to_string(), param_value_json(value));
            }
            Some((node.clone(), Value::Object(def)))
        }
        DeviceBody::FormatNode {
            node,
            driver,
            children,
            ..
        } => {
            let mut def = Map::new();
            def.insert("driver".into(), Value::String(driver.clone()));
            def.insert("node-name".into(), Value::String(node.clone()));
            if !children.is_empty() {
                def.insert(
                    "children".into(),
                    Value::Array(children.iter().map(|c| Value::String(c.clone())).collect()),
                );
            }
            for (name, value) in dev.params().iter() {
                def.insert(name.to_string(), param_value_json(value));
            }
            Some((node.clone(), Value::Object(def)))
        }
        _ => None,
    }
}

/// Emits the ordered linear fragment sequence for the whole topology.
#[must_use]
pub fn command_fragments(reg: &TopologyRegistry) -> Vec<String> {
    let mut out = Vec::new();

    for thread in reg.iothreads().thread_ids() {
        out.push("-object".to_string());
        out.push(format!("iothread,id={thread}"));
    }

    for dev in reg.devices() {
        match dev.body() {
            DeviceBody::Raw { fragment } => out.extend(fragment.iter().cloned()),
            DeviceBody::Structured { driver } | DeviceBody::Controller { driver } => {
                out.push("-device".to_string());
                out.push(device_fragment(dev, driver));
            }
            DeviceBody::ProtocolNode { .. } | DeviceBody::FormatNode { .. } => {
                if let Some((_, def)) = node_definition(dev) {
                    out.push("-blockdev".to_string());
                    out.push(def.to_string());
                }
            }
            // Daemon invocations are separate processes, not fragments.
            DeviceBody::Daemon { .. } => {}
        }
    }
    out
}

/// Emits the full invocation tail as one string.
#[must_use]
pub fn command_line(reg: &TopologyRegistry) -> String {
    command_fragments(reg).join(" ")
}

/// Emits the storage node graph for structured mode.
#[must_use]
pub fn node_graph(reg: &TopologyRegistry) -> NodeGraph {
    let mut graph = NodeGraph::default();
    for dev in reg.devices() {
        if let Some((name, def)) = node_definition(dev) {
            graph.nodes.insert(name, def);
        }
    }
    graph
}

/// Emits the external daemon invocation lines, in insertion order.
#[must_use]
pub fn daemon_commands(reg: &TopologyRegistry) -> Vec<String> {
    reg.devices()
        .filter_map(|dev| match dev.body() {
            DeviceBody::Daemon { argv } => Some(argv.join(" ")),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusInstance, BusKind, BusRequest};
    use gantry_capability::{CapabilitySet, Version};

    fn registry() -> TopologyRegistry {
        let mut reg = TopologyRegistry::new(CapabilitySet::bare(Version::new(&[5, 0])));
        reg.add_root_bus(BusInstance::root("pci.0", BusKind::Pci))
            .unwrap();
        reg
    }

    #[test]
    fn fragments_follow_insertion_order() {
        let mut reg = registry();
        reg.insert(DeviceNode::raw(&["-display", "none"])).unwrap();
        reg.insert(
            DeviceNode::structured("e1000")
                .with_qid("net0")
                .with_parent_bus(BusRequest::kind(BusKind::Pci))
                .with_param("mac", "52:54:00:12:34:56"),
        )
        .unwrap();

        assert_eq!(
            command_fragments(&reg),
            vec![
                "-display",
                "none",
                "-device",
                "e1000,id=net0,bus=pci.0,addr=0x0,mac=52:54:00:12:34:56",
            ]
        );
    }

    #[test]
    fn node_graph_links_children() {
        let mut reg = registry();
        reg.insert(DeviceNode::protocol_node("proto0", "file").with_qid("proto0"))
            .unwrap();
        let mut fmt = DeviceNode::format_node("fmt0", "qcow2").with_qid("fmt0");
        fmt.link_storage_child("proto0");
        fmt.params_mut().set("file", "proto0");
        reg.insert(fmt).unwrap();

        let graph = node_graph(&reg);
        assert_eq!(graph.len(), 2);
        let def = graph.get("fmt0").unwrap();
        assert_eq!(def["children"][0], "proto0");
        assert_eq!(def["driver"], "qcow2");
    }

    #[test]
    fn output_is_deterministic() {
        let build = || {
            let mut reg = registry();
            reg.insert(
                DeviceNode::structured("e1000")
                    .with_qid("net0")
                    .with_parent_bus(BusRequest::kind(BusKind::Pci))
                    .with_param("mac", "52:54:00:12:34:56")
                    .with_param("bootindex", 1i64),
            )
            .unwrap();
            reg.insert(DeviceNode::protocol_node("proto0", "file").with_qid("proto0"))
                .unwrap();
            (command_line(&reg), node_graph(&reg).to_json())
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn daemons_emit_separately() {
        let mut reg = registry();
        reg.insert(DeviceNode::daemon(&["storage-daemon", "--fd", "3"]))
            .unwrap();
        assert!(command_fragments(&reg).is_empty());
        assert_eq!(daemon_commands(&reg), vec!["storage-daemon --fd 3"]);
    }
}
