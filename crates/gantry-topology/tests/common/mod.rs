//! Shared test double for the live process: a fake monitor that tracks the
//! device and node sets the way the real side would, with switches to force
//! the interesting failure shapes.

use std::collections::BTreeSet;
use std::time::Duration;

use gantry_topology::{ChannelError, CommandChannel, Output};
use serde_json::Value;

/// Scripted stand-in for the hypervisor's command channel.
#[derive(Debug, Default)]
pub struct FakeMonitor {
    /// Live device ids.
    pub devices: BTreeSet<String>,
    /// Live storage node names.
    pub nodes: BTreeSet<String>,
    /// Every executed command name, in order.
    pub log: Vec<String>,
    /// Answer `device_add` with an error output.
    pub reject_device_add: bool,
    /// Accept `device_del`/`blockdev_del` but never actually detach.
    pub ignore_removals: bool,
    /// Accept `blockdev_del` but never actually drop the node.
    pub ignore_node_removals: bool,
    /// Fail the next execute with a timeout.
    pub timeout_next: bool,
    /// Answer hook commands with an error output.
    pub fail_hooks: bool,
}

impl FakeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn arg_str(args: Option<&Value>, key: &str) -> Option<String> {
        args.and_then(|v| v.get(key))
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }

    fn listing(set: &BTreeSet<String>) -> Output {
        Output::text(set.iter().cloned().collect::<Vec<_>>().join("\n"))
    }
}

impl CommandChannel for FakeMonitor {
    fn execute(
        &mut self,
        command: &str,
        args: Option<&Value>,
        timeout: Duration,
    ) -> Result<Output, ChannelError> {
        self.log.push(command.to_string());
        if self.timeout_next {
            self.timeout_next = false;
            return Err(ChannelError::Timeout(timeout));
        }
        match command {
            "device_add" => {
                if self.reject_device_add {
                    return Ok(Output::text("Error: attach rejected"));
                }
                if let Some(id) = Self::arg_str(args, "id") {
                    self.devices.insert(id);
                }
                Ok(Output::empty())
            }
            "device_del" => {
                if !self.ignore_removals {
                    if let Some(id) = Self::arg_str(args, "id") {
                        self.devices.remove(&id);
                    }
                }
                Ok(Output::empty())
            }
            "blockdev_add" => {
                if let Some(node) = Self::arg_str(args, "node-name") {
                    self.nodes.insert(node);
                }
                Ok(Output::empty())
            }
            "blockdev_del" => {
                if !self.ignore_removals && !self.ignore_node_removals {
                    if let Some(node) = Self::arg_str(args, "node-name") {
                        self.nodes.remove(&node);
                    }
                }
                Ok(Output::empty())
            }
            "device_list" => Ok(Self::listing(&self.devices)),
            "node_list" => Ok(Self::listing(&self.nodes)),
            _ => {
                if self.fail_hooks {
                    Ok(Output::text("Error: hook failed"))
                } else {
                    Ok(Output::empty())
                }
            }
        }
    }
}

/// Fast polling parameters so indeterminate paths do not stall the suite.
#[must_use]
pub fn fast_timing() -> gantry_topology::PollTiming {
    gantry_topology::PollTiming {
        first_delay: Duration::from_millis(1),
        step: Duration::from_millis(5),
        timeout: Duration::from_millis(60),
    }
}
