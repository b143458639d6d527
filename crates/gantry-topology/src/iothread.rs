//! Shared I/O thread pool.
//!
//! Eligible devices are assigned a thread handle according to a policy
//! chosen once per registry lifetime. Handles are reference-counted inside
//! the pool; release happens automatically when the owning device leaves
//! the registry, and a released handle never lingers in the policy's
//! bookkeeping.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Allocation policy for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoThreadScheme {
    /// The caller names the thread explicitly per device.
    Predefined,
    /// Cycle through a fixed list of threads.
    RoundRobin(Vec<String>),
    /// Allocate a fresh thread per eligible device.
    PerDevice,
    /// Pooling disabled; requests yield no handle.
    Disabled,
}

/// Handle to one pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IoThreadHandle {
    id: String,
}

impl IoThreadHandle {
    /// The thread's emitted object id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for IoThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Pool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IoThreadError {
    /// The predefined scheme needs an explicit name.
    #[error("iothread scheme requires an explicit thread name")]
    NameRequired,

    /// The round-robin scheme was configured with an empty thread list.
    #[error("iothread pool has no threads to cycle through")]
    NoThreads,
}

#[derive(Debug, Default, Clone)]
struct Entry {
    refs: u32,
}

/// The pool itself.
#[derive(Debug, Clone)]
pub struct IoThreadPool {
    scheme: IoThreadScheme,
    entries: BTreeMap<String, Entry>,
    cursor: usize,
    next_auto: u32,
}

impl IoThreadPool {
    /// Creates a pool with the given policy.
    #[must_use]
    pub fn new(scheme: IoThreadScheme) -> Self {
        let mut entries = BTreeMap::new();
        if let IoThreadScheme::RoundRobin(names) = &scheme {
            for n in names {
                entries.insert(n.clone(), Entry::default());
            }
        }
        Self {
            scheme,
            entries,
            cursor: 0,
            next_auto: 0,
        }
    }

    /// The configured policy.
    #[must_use]
    pub const fn scheme(&self) -> &IoThreadScheme {
        &self.scheme
    }

    /// Requests a handle for a device.
    ///
    /// Passing the same explicit name twice is idempotent: the same handle
    /// comes back with its reference count bumped. `Ok(None)` means the
    /// scheme disables pooling for this request.
    ///
    /// # Errors
    ///
    /// Returns [`IoThreadError::NameRequired`] under the predefined scheme
    /// without a name, and [`IoThreadError::NoThreads`] for an empty
    /// round-robin list.
    pub fn request(&mut self, name: Option<&str>) -> Result<Option<IoThreadHandle>, IoThreadError> {
        let id = match (&self.scheme, name) {
            (IoThreadScheme::Disabled, _) => return Ok(None),
            (_, Some(name)) => name.to_string(),
            (IoThreadScheme::Predefined, None) => return Err(IoThreadError::NameRequired),
            (IoThreadScheme::RoundRobin(names), None) => {
                if names.is_empty() {
                    return Err(IoThreadError::NoThreads);
                }
                let id = names[self.cursor % names.len()].clone();
                self.cursor += 1;
                id
            }
            (IoThreadScheme::PerDevice, None) => {
                let id = format!("iothread{}", self.next_auto);
                self.next_auto += 1;
                id
            }
        };

        self.entries.entry(id.clone()).or_default().refs += 1;
        tracing::trace!(thread = %id, "iothread handle acquired");
        Ok(Some(IoThreadHandle { id }))
    }

    /// Releases a handle.
    ///
    /// Entries with no remaining references are dropped from the
    /// bookkeeping unless the scheme pre-declared them (round-robin lists
    /// keep their threads for future cycles).
    pub fn release(&mut self, handle: &IoThreadHandle) {
        let drop_entry = match self.entries.get_mut(&handle.id) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0 && !self.is_predeclared(&handle.id)
            }
            None => false,
        };
        if drop_entry {
            self.entries.remove(&handle.id);
            tracing::trace!(thread = %handle.id, "iothread entry dropped");
        }
    }

    fn is_predeclared(&self, id: &str) -> bool {
        match &self.scheme {
            IoThreadScheme::RoundRobin(names) => names.iter().any(|n| n == id),
            _ => false,
        }
    }

    /// True when the pool currently tracks the thread.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Reference count for one thread (0 when untracked).
    #[must_use]
    pub fn refs(&self, id: &str) -> u32 {
        self.entries.get(id).map_or(0, |e| e.refs)
    }

    /// Thread ids currently tracked, in name order.
    pub fn thread_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
