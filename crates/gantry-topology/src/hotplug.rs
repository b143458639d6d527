//! Live reconfiguration: the hotplug/unplug transaction engine.
//!
//! The registry and the live process are two independently-evolving state
//! machines; every operation here moves both and keeps the registry's
//! dirtiness counter honest about the divergence in between. Verification
//! is bounded polling with caller-visible parameters — never a silent or
//! infinite retry — and a deadline that elapses without confirmation yields
//! an *indeterminate* outcome, not an error and not a fabricated success.

use std::thread;
use std::time::{Duration, Instant};

use crate::channel::{ChannelError, CommandChannel, Output};
use crate::device::{DeviceFeature, DeviceNode};
use crate::error::{HotplugError, UnplugError};
use crate::params::ParamValue;
use crate::registry::TopologyRegistry;

/// Polling parameters for live verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    /// Delay before the first verification query.
    pub first_delay: Duration,
    /// Fixed delay between subsequent queries.
    pub step: Duration,
    /// Overall deadline for the operation's verification.
    pub timeout: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(100),
            step: Duration::from_millis(250),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a hotplug request.
#[derive(Debug)]
pub enum HotplugOutcome {
    /// Inserted, issued, and confirmed live.
    Attached {
        /// Alias of the attached device.
        aid: String,
    },
    /// The live side did not confirm; the representation was cleaned up.
    Rejected {
        /// Alias the device briefly held.
        aid: String,
        /// Output of the attach command, for diagnosis.
        output: Output,
    },
    /// The command's effect is unknown (channel timeout). The device stays
    /// in the representation and the pending counter keeps its +1.
    Indeterminate {
        /// Alias of the possibly-attached device.
        aid: String,
    },
}

/// Outcome of an unplug request.
#[derive(Debug, PartialEq, Eq)]
pub enum UnplugOutcome {
    /// Confirmed live and removed from the representation.
    Confirmed {
        /// Aliases removed, cascade included.
        removed: Vec<String>,
    },
    /// The deadline elapsed without confirmation. The device may still be
    /// attached; the representation is untouched and the pending counter
    /// keeps its +1.
    Indeterminate,
}

/// Drives live topology changes against one registry and one channel.
pub struct HotplugEngine<'a, C: CommandChannel> {
    registry: &'a mut TopologyRegistry,
    channel: &'a mut C,
    timing: PollTiming,
}

impl<'a, C: CommandChannel> HotplugEngine<'a, C> {
    /// Binds the engine to a registry and a live channel. Marks the
    /// registry as attached to a live process.
    pub fn new(registry: &'a mut TopologyRegistry, channel: &'a mut C) -> Self {
        registry.attach_live();
        Self {
            registry,
            channel,
            timing: PollTiming::default(),
        }
    }

    /// Overrides the polling parameters.
    #[must_use]
    pub const fn with_timing(mut self, timing: PollTiming) -> Self {
        self.timing = timing;
        self
    }

    // =========================================================================
    // Hotplug
    // =========================================================================

    /// Live-attaches one device.
    ///
    /// `bus` optionally names the target bus; otherwise the device's own
    /// parent-bus requirements drive the search, which prefers the earliest
    /// registered bus of the natural kind.
    ///
    /// # Errors
    ///
    /// [`HotplugError`] when the insert step fails, the request cascades,
    /// or the channel breaks; the representation is never left
    /// half-attached.
    pub fn hotplug(
        &mut self,
        device: DeviceNode,
        bus: Option<&str>,
    ) -> Result<HotplugOutcome, HotplugError> {
        if !device.supports(DeviceFeature::Hotplug) {
            return Err(HotplugError::Unsupported(device.alias_base()));
        }
        let mut device = device;
        self.target_bus(&mut device, bus);

        self.registry.mark_dirty();

        // Exactly one device may enter per live attach; a cascade cannot be
        // expressed as one live operation.
        let inserted = self.registry.insert(device)?;
        if inserted.len() != 1 {
            let count = inserted.len();
            for aid in inserted.iter().rev() {
                let _ = self.registry.remove(aid);
            }
            self.registry.confirm();
            return Err(HotplugError::UnexpectedCascade(count));
        }
        let aid = inserted.into_iter().next().unwrap_or_default();

        let Some(cmd) = self.registry.get(&aid).and_then(DeviceNode::hotplug_command) else {
            let _ = self.registry.remove(&aid);
            self.registry.confirm();
            return Err(HotplugError::Unsupported(aid));
        };

        tracing::info!(alias = %aid, command = %cmd.name, "hotplug issued");
        let out = match self
            .channel
            .execute(&cmd.name, cmd.args.as_ref(), self.timing.timeout)
        {
            Ok(out) => out,
            Err(ChannelError::Timeout(_)) => {
                tracing::warn!(alias = %aid, "hotplug command timed out; state unknown");
                return Ok(HotplugOutcome::Indeterminate { aid });
            }
            Err(err) => {
                let _ = self.registry.remove(&aid);
                self.registry.confirm();
                return Err(HotplugError::Channel(err));
            }
        };

        let dev = self.registry.get(&aid).cloned();
        let verified = match dev {
            Some(dev) => match dev.verify_hotplug(&out, self.channel, self.timing.timeout) {
                Ok(v) => v,
                Err(ChannelError::Timeout(_)) => {
                    return Ok(HotplugOutcome::Indeterminate { aid });
                }
                Err(err) => return Err(HotplugError::Channel(err)),
            },
            None => false,
        };

        if verified {
            self.registry.confirm();
            tracing::info!(alias = %aid, "hotplug confirmed");
            Ok(HotplugOutcome::Attached { aid })
        } else {
            // Best-effort cleanup of a half-applied live change.
            let _ = self.registry.remove(&aid);
            self.registry.confirm();
            tracing::warn!(alias = %aid, "hotplug rejected; representation cleaned");
            Ok(HotplugOutcome::Rejected { aid, output: out })
        }
    }

    /// Folds an explicit target bus into the device's requirements: the
    /// first requirement the named bus can satisfy gets pinned to it; a
    /// device without requirements gains one of the bus's kind.
    fn target_bus(&self, device: &mut DeviceNode, bus: Option<&str>) {
        let Some(name) = bus else { return };
        let kind = self.registry.bus(name).map(crate::bus::BusInstance::kind);
        let reqs = device.parent_buses_mut();
        if let Some(kind) = kind {
            if let Some(req) = reqs.iter_mut().find(|r| kind.satisfies(r.kind)) {
                req.name = Some(name.to_string());
                return;
            }
            reqs.push(crate::bus::BusRequest::named(kind, name));
        } else {
            // Unknown bus: pin the first requirement so the insert fails
            // with the requirement named in the error.
            if let Some(req) = reqs.first_mut() {
                req.name = Some(name.to_string());
            }
        }
    }

    // =========================================================================
    // Unplug
    // =========================================================================

    /// Live-detaches a device and, on confirmation, removes it (and its
    /// storage-node chain, children first) from the representation.
    ///
    /// # Errors
    ///
    /// [`UnplugError`] for the divergence shapes and hook failures. A
    /// verification deadline is not an error: it yields
    /// [`UnplugOutcome::Indeterminate`].
    pub fn unplug(&mut self, aid: &str) -> Result<UnplugOutcome, UnplugError> {
        let dev = self
            .registry
            .get(aid)
            .cloned()
            .ok_or_else(|| UnplugError::NotFound(aid.to_string()))?;
        if !dev.supports(DeviceFeature::Unplug) {
            return Err(UnplugError::Unsupported(aid.to_string()));
        }
        let Some(cmd) = dev.unplug_command() else {
            return Err(UnplugError::Unsupported(aid.to_string()));
        };

        self.registry.mark_dirty();

        tracing::info!(alias = %aid, command = %cmd.name, "unplug issued");
        let out = match self
            .channel
            .execute(&cmd.name, cmd.args.as_ref(), self.timing.timeout)
        {
            Ok(out) => out,
            Err(ChannelError::Timeout(_)) => {
                tracing::warn!(alias = %aid, "unplug command timed out; state unknown");
                return Ok(UnplugOutcome::Indeterminate);
            }
            Err(err) => {
                // The command never ran; no divergence was created.
                self.registry.confirm();
                return Err(UnplugError::Channel(err));
            }
        };

        if !self.poll_unplug(&dev, &out)? {
            tracing::warn!(alias = %aid, "unplug unconfirmed within deadline");
            return Ok(UnplugOutcome::Indeterminate);
        }

        // Live removal confirmed.
        self.registry.confirm();

        if let Some(hooks) = dev.unplug_hooks() {
            let hook_ok = matches!(
                self.channel
                    .execute(&hooks.hook.name, hooks.hook.args.as_ref(), self.timing.timeout),
                Ok(ref out) if !out.is_error()
            );
            if !hook_ok {
                let _ = self.channel.execute(
                    &hooks.unhook.name,
                    hooks.unhook.args.as_ref(),
                    self.timing.timeout,
                );
                return Err(UnplugError::Hook {
                    aid: aid.to_string(),
                    reason: "unplug hook command failed".to_string(),
                });
            }
        }

        // Storage chain below the device goes first, children before
        // parents, each confirmed live before its node leaves the
        // representation.
        if let Some(ParamValue::Str(chain_root)) = dev.params().get("drive").cloned() {
            self.unplug_node(&chain_root)?;
        }
        for child in dev.storage_children().to_vec() {
            self.unplug_node(&child)?;
        }

        let removed = self
            .registry
            .remove(aid)
            .map_err(|source| UnplugError::StuckInRepresentation {
                aid: aid.to_string(),
                source,
            })?;

        tracing::info!(alias = %aid, removed = ?removed, "unplug confirmed");
        Ok(UnplugOutcome::Confirmed { removed })
    }

    /// Recursively unplugs one storage node: children first, then the live
    /// detach of the node itself, then its removal from the representation
    /// (which unlinks it from any parent's child list).
    fn unplug_node(&mut self, node_aid: &str) -> Result<(), UnplugError> {
        let Some(node) = self.registry.get(node_aid).cloned() else {
            return Ok(());
        };

        for child in node.storage_children().to_vec() {
            self.unplug_node(&child)?;
        }

        let Some(cmd) = node.unplug_command() else {
            return Ok(());
        };
        let out = match self
            .channel
            .execute(&cmd.name, cmd.args.as_ref(), self.timing.timeout)
        {
            Ok(out) => out,
            Err(_) => {
                return Err(UnplugError::LiveUnconfirmed {
                    aid: node_aid.to_string(),
                });
            }
        };
        if !self.poll_unplug(&node, &out)? {
            return Err(UnplugError::LiveUnconfirmed {
                aid: node_aid.to_string(),
            });
        }

        self.registry
            .remove(node_aid)
            .map_err(|source| UnplugError::StuckInRepresentation {
                aid: node_aid.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Bounded verification polling: first delay, then fixed steps, until
    /// the overall deadline. Query timeouts count as "not yet"; transport
    /// failures abort.
    fn poll_unplug(&mut self, dev: &DeviceNode, out: &Output) -> Result<bool, UnplugError> {
        let started = Instant::now();
        let deadline = self.timing.timeout;
        sleep_capped(self.timing.first_delay, started, deadline);

        loop {
            match dev.verify_unplug(out, self.channel, deadline) {
                Ok(true) => return Ok(true),
                Ok(false) | Err(ChannelError::Timeout(_)) => {}
                Err(err) => return Err(UnplugError::Channel(err)),
            }
            if started.elapsed() >= deadline {
                return Ok(false);
            }
            sleep_capped(self.timing.step, started, deadline);
        }
    }
}

/// Sleeps for `wanted`, clipped so the overall deadline is not overshot by
/// a full step.
fn sleep_capped(wanted: Duration, started: Instant, deadline: Duration) {
    let remaining = deadline.saturating_sub(started.elapsed());
    let nap = wanted.min(remaining);
    if !nap.is_zero() {
        thread::sleep(nap);
    }
}
