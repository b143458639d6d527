//! Typed device parameters.
//!
//! A parameter entry distinguishes three states: absent (no key), set to a
//! typed value, and *explicitly unset* (key present, no value). The last one
//! matters during builder passes: a later stage can see that an earlier
//! stage deliberately cleared a parameter rather than never having touched
//! it. Unset entries are skipped during emission.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One typed parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Free-form string.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Boolean, emitted as `on`/`off`.
    Bool(bool),
    /// Unsigned value emitted in hex notation.
    Hex(u64),
    /// Bare symbol emitted without quoting.
    Symbol(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) | Self::Symbol(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(true) => f.write_str("on"),
            Self::Bool(false) => f.write_str("off"),
            Self::Hex(h) => write!(f, "{h:#x}"),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Ordered map of named parameters.
///
/// Ordering is lexicographic by name so that emission is deterministic for
/// equal inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamMap {
    entries: BTreeMap<String, Option<ParamValue>>,
}

impl ParamMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter to a value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> &mut Self {
        self.entries.insert(name.into(), Some(value.into()));
        self
    }

    /// Marks a parameter as explicitly unset.
    pub fn unset(&mut self, name: impl Into<String>) -> &mut Self {
        self.entries.insert(name.into(), None);
        self
    }

    /// Drops an entry entirely, returning to the absent state.
    pub fn clear(&mut self, name: &str) -> &mut Self {
        self.entries.remove(name);
        self
    }

    /// Returns the value of a set parameter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.get(name).and_then(Option::as_ref)
    }

    /// True when the entry exists but was explicitly unset.
    #[must_use]
    pub fn is_unset(&self, name: &str) -> bool {
        matches!(self.entries.get(name), Some(None))
    }

    /// True when no entry exists for the name at all.
    #[must_use]
    pub fn is_absent(&self, name: &str) -> bool {
        !self.entries.contains_key(name)
    }

    /// Iterates set entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.as_str(), v)))
    }

    /// Number of entries, including unset ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders set entries as `name=value` pairs in name order.
    #[must_use]
    pub fn render_pairs(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

impl FromIterator<(String, ParamValue)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k, Some(v))).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_vs_unset() {
        let mut p = ParamMap::new();
        p.set("cache", "none").unset("discard");

        assert!(p.get("cache").is_some());
        assert!(p.get("discard").is_none());
        assert!(p.is_unset("discard"));
        assert!(!p.is_absent("discard"));
        assert!(p.is_absent("aio"));
    }

    #[test]
    fn unset_entries_skip_emission() {
        let mut p = ParamMap::new();
        p.set("b", 4i64).set("a", true).unset("c");
        assert_eq!(p.render_pairs(), vec!["a=on", "b=4"]);
    }

    #[test]
    fn hex_rendering() {
        let mut p = ParamMap::new();
        p.set("addr", ParamValue::Hex(0x1f));
        assert_eq!(p.render_pairs(), vec!["addr=0x1f"]);
    }

    #[test]
    fn clear_returns_to_absent() {
        let mut p = ParamMap::new();
        p.unset("x");
        p.clear("x");
        assert!(p.is_absent("x"));
    }
}
