//! Multi-dimensional bus address spaces.
//!
//! A bus address is an ordered coordinate tuple over the bus's shape — one
//! dimension for a linear slot bus, two for chassis/slot or id/lun shapes.
//! Allocation always fills the lowest free tuple in lexicographic order
//! unless a hint pins an exact coordinate.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One coordinate tuple inside an address space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(Vec<u32>);

impl Address {
    /// Creates an address from its coordinates.
    #[must_use]
    pub fn new(coords: &[u32]) -> Self {
        Self(coords.to_vec())
    }

    /// Convenience constructor for one-dimensional slot addresses.
    #[must_use]
    pub fn slot(n: u32) -> Self {
        Self(vec![n])
    }

    /// The coordinate values.
    #[must_use]
    pub fn coords(&self) -> &[u32] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.0 {
            if !first {
                write!(f, ":")?;
            }
            write!(f, "{c}")?;
            first = false;
        }
        Ok(())
    }
}

/// Shape of an address space: ordered (dimension name, capacity) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressShape {
    dims: Vec<(String, u32)>,
}

impl AddressShape {
    /// Creates a shape from (name, capacity) pairs.
    ///
    /// Zero-capacity dimensions are meaningless and rejected by debug
    /// assertion; capacity checks elsewhere rely on every dimension holding
    /// at least one coordinate.
    #[must_use]
    pub fn new(dims: &[(&str, u32)]) -> Self {
        debug_assert!(dims.iter().all(|(_, c)| *c > 0));
        Self {
            dims: dims.iter().map(|(n, c)| ((*n).to_string(), *c)).collect(),
        }
    }

    /// Linear single-dimension shape.
    #[must_use]
    pub fn linear(name: &str, capacity: u32) -> Self {
        Self::new(&[(name, capacity)])
    }

    /// Dimension descriptors in order.
    #[must_use]
    pub fn dims(&self) -> &[(String, u32)] {
        &self.dims
    }

    /// Total number of addressable tuples.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.dims.iter().map(|(_, c)| u64::from(*c)).product()
    }

    /// The lexicographically first address (all zeros).
    #[must_use]
    pub fn first(&self) -> Address {
        Address(vec![0; self.dims.len()])
    }

    /// The lexicographic successor of `addr`, if any.
    #[must_use]
    pub fn next(&self, addr: &Address) -> Option<Address> {
        let mut coords = addr.0.clone();
        for i in (0..coords.len()).rev() {
            if coords[i] + 1 < self.dims[i].1 {
                coords[i] += 1;
                return Some(Address(coords));
            }
            coords[i] = 0;
        }
        None
    }

    /// True when `addr` has the right arity and every coordinate is within
    /// its dimension's capacity.
    #[must_use]
    pub fn contains(&self, addr: &Address) -> bool {
        addr.0.len() == self.dims.len()
            && addr.0.iter().zip(&self.dims).all(|(c, (_, cap))| c < cap)
    }
}

/// Reservation state over one shape.
///
/// Once allocated, the space is monotonically consumed except through an
/// explicit [`release`](AddressSpace::release) — the rollback path of a
/// failed transaction or a confirmed unplug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    shape: AddressShape,
    reserved: BTreeSet<Address>,
}

impl AddressSpace {
    /// Creates an empty space over the shape.
    #[must_use]
    pub fn new(shape: AddressShape) -> Self {
        Self {
            shape,
            reserved: BTreeSet::new(),
        }
    }

    /// The underlying shape.
    #[must_use]
    pub const fn shape(&self) -> &AddressShape {
        &self.shape
    }

    /// Finds the first unreserved address in lexicographic order, honoring
    /// an explicit hint when given: a hinted address is returned only if it
    /// is in range and free, otherwise the search reports no slot rather
    /// than silently relocating the device.
    #[must_use]
    pub fn free_slot(&self, hint: Option<&Address>) -> Option<Address> {
        if let Some(hint) = hint {
            if self.shape.contains(hint) && !self.reserved.contains(hint) {
                return Some(hint.clone());
            }
            return None;
        }

        let mut cursor = self.shape.first();
        loop {
            if !self.reserved.contains(&cursor) {
                return Some(cursor);
            }
            cursor = self.shape.next(&cursor)?;
        }
    }

    /// Reserves an address. Returns `false` when the address is out of
    /// range or already taken.
    pub fn reserve(&mut self, addr: &Address) -> bool {
        if !self.shape.contains(addr) || self.reserved.contains(addr) {
            return false;
        }
        self.reserved.insert(addr.clone());
        true
    }

    /// Releases a reservation. Returns `true` when it existed.
    pub fn release(&mut self, addr: &Address) -> bool {
        self.reserved.remove(addr)
    }

    /// True when the address is in range and unreserved.
    #[must_use]
    pub fn is_free(&self, addr: &Address) -> bool {
        self.shape.contains(addr) && !self.reserved.contains(addr)
    }

    /// Number of reserved addresses.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// Reserved addresses in lexicographic order.
    pub fn reserved(&self) -> impl Iterator<Item = &Address> {
        self.reserved.iter()
    }
}
