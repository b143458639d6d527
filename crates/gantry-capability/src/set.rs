//! Symbolic capability flags and immutable capability snapshots.

use std::collections::HashSet;
use std::fmt;

use crate::version::{Version, VersionSpan};

/// Symbolic features the target hypervisor build may support.
///
/// Closed enumeration: a new flag is added here and in the span table of
/// [`CapabilitySet::from_version`], never probed ad hoc at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Structured storage graph: protocol/format node chains instead of
    /// flat drive fragments.
    ModernStorage,
    /// Dedicated I/O thread objects assignable to storage controllers.
    IoThread,
    /// AHCI controller available as a native IDE-compatible bus.
    Ahci,
    /// Storage backends served by an external per-device daemon.
    DaemonStorage,
    /// PCI Express root ports for endpoint hotplug.
    PcieRootPort,
}

impl Capability {
    /// Stable name used in logs and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ModernStorage => "modern-storage",
            Self::IoThread => "iothread",
            Self::Ahci => "ahci",
            Self::DaemonStorage => "daemon-storage",
            Self::PcieRootPort => "pcie-root-port",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of what one target process build supports.
///
/// Built once per target identity and handed to the topology registry at
/// construction time; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    version: Version,
    flags: HashSet<Capability>,
}

impl CapabilitySet {
    /// Creates a snapshot from an externally probed version and flag set.
    #[must_use]
    pub fn new(version: Version, flags: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            version,
            flags: flags.into_iter().collect(),
        }
    }

    /// Creates a snapshot with no flags at all, for tests and for targets
    /// that predate every optional feature.
    #[must_use]
    pub fn bare(version: Version) -> Self {
        Self {
            version,
            flags: HashSet::new(),
        }
    }

    /// Derives the flag set from the version alone, using the built-in
    /// introduction table. Each membership test runs exactly once, here.
    #[must_use]
    pub fn from_version(version: Version) -> Self {
        let table: &[(Capability, VersionSpan)] = &[
            (Capability::Ahci, VersionSpan::since(Version::new(&[1, 5]))),
            (Capability::IoThread, VersionSpan::since(Version::new(&[2, 1]))),
            (
                Capability::ModernStorage,
                VersionSpan::since(Version::new(&[2, 9])),
            ),
            (
                Capability::PcieRootPort,
                VersionSpan::since(Version::new(&[2, 9])),
            ),
            (
                Capability::DaemonStorage,
                VersionSpan::since(Version::new(&[4, 2])),
            ),
        ];

        let flags: HashSet<Capability> = table
            .iter()
            .filter(|(_, span)| span.contains(&version))
            .map(|(cap, _)| *cap)
            .collect();

        tracing::debug!(%version, flags = flags.len(), "derived capability set");
        Self { version, flags }
    }

    /// The probed version value.
    #[must_use]
    pub const fn version(&self) -> &Version {
        &self.version
    }

    /// Opaque boolean query for one flag.
    #[must_use]
    pub fn supports(&self, cap: Capability) -> bool {
        self.flags.contains(&cap)
    }

    /// Number of flags present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// True if no flags are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn bare_set_supports_nothing() {
        let caps = CapabilitySet::bare(v("1.0"));
        assert!(!caps.supports(Capability::ModernStorage));
        assert!(caps.is_empty());
    }

    #[test]
    fn from_version_applies_table() {
        let old = CapabilitySet::from_version(v("2.0"));
        assert!(old.supports(Capability::Ahci));
        assert!(!old.supports(Capability::IoThread));
        assert!(!old.supports(Capability::ModernStorage));

        let new = CapabilitySet::from_version(v("5.1"));
        assert!(new.supports(Capability::IoThread));
        assert!(new.supports(Capability::ModernStorage));
        assert!(new.supports(Capability::DaemonStorage));
    }

    #[test]
    fn explicit_flags_override_table() {
        let caps = CapabilitySet::new(v("1.0"), [Capability::ModernStorage]);
        assert!(caps.supports(Capability::ModernStorage));
        assert!(!caps.supports(Capability::Ahci));
    }
}
