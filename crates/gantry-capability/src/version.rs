//! Version values and half-open membership spans.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CapabilityError;

/// A dotted numeric version value, e.g. `8.2.1`.
///
/// Comparison is component-wise; missing trailing components compare as
/// zero, so `2.9` and `2.9.0` are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    parts: Vec<u32>,
}

impl Version {
    /// Creates a version from its numeric components.
    #[must_use]
    pub fn new(parts: &[u32]) -> Self {
        Self {
            parts: parts.to_vec(),
        }
    }

    /// Returns the numeric components.
    #[must_use]
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }
}

impl FromStr for Version {
    type Err = CapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Result<Vec<u32>, _> = s.trim().split('.').map(str::parse).collect();
        match parts {
            Ok(parts) if !parts.is_empty() => Ok(Self { parts }),
            _ => Err(CapabilityError::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for p in &self.parts {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{p}")?;
            first = false;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Trailing zeros are insignificant for equality; keep hashing
        // consistent with that.
        let significant = self
            .parts
            .iter()
            .rposition(|p| *p != 0)
            .map_or(0, |i| i + 1);
        self.parts[..significant].hash(state);
    }
}

/// One endpoint of a [`VersionSpan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    /// No constraint on this side.
    Unbounded,
    /// The endpoint value itself is inside the span.
    Inclusive(Version),
    /// The endpoint value itself is outside the span.
    Exclusive(Version),
}

/// A `[lower, upper)`-style version interval with open/closed endpoints.
///
/// The default shape used by the capability table is inclusive-lower,
/// exclusive-upper, but both endpoints are independently configurable for
/// the occasional capability that was removed again or backported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpan {
    lower: Bound,
    upper: Bound,
}

impl VersionSpan {
    /// Span covering every version.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Span `[lower, +inf)`.
    #[must_use]
    pub const fn since(lower: Version) -> Self {
        Self {
            lower: Bound::Inclusive(lower),
            upper: Bound::Unbounded,
        }
    }

    /// Span `[lower, upper)`.
    #[must_use]
    pub const fn between(lower: Version, upper: Version) -> Self {
        Self {
            lower: Bound::Inclusive(lower),
            upper: Bound::Exclusive(upper),
        }
    }

    /// Span with explicit endpoint bounds.
    #[must_use]
    pub const fn with_bounds(lower: Bound, upper: Bound) -> Self {
        Self { lower, upper }
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, v: &Version) -> bool {
        let above = match &self.lower {
            Bound::Unbounded => true,
            Bound::Inclusive(l) => v >= l,
            Bound::Exclusive(l) => v > l,
        };
        let below = match &self.upper {
            Bound::Unbounded => true,
            Bound::Inclusive(u) => v <= u,
            Bound::Exclusive(u) => v < u,
        };
        above && below
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display() {
        let ver = v("8.2.1");
        assert_eq!(ver.parts(), &[8, 2, 1]);
        assert_eq!(ver.to_string(), "8.2.1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("a.b".parse::<Version>().is_err());
        assert!("1..2".parse::<Version>().is_err());
    }

    #[test]
    fn ordering_pads_with_zero() {
        assert_eq!(v("2.9"), v("2.9.0"));
        assert!(v("2.9") < v("2.10"));
        assert!(v("3.0") > v("2.12.1"));
    }

    #[test]
    fn span_half_open() {
        let span = VersionSpan::between(v("2.9"), v("4.0"));
        assert!(!span.contains(&v("2.8.1")));
        assert!(span.contains(&v("2.9")));
        assert!(span.contains(&v("3.9.9")));
        assert!(!span.contains(&v("4.0")));
    }

    #[test]
    fn span_open_lower() {
        let span = VersionSpan::with_bounds(Bound::Exclusive(v("2.9")), Bound::Unbounded);
        assert!(!span.contains(&v("2.9")));
        assert!(span.contains(&v("2.9.1")));
    }
}
