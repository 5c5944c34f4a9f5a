//! Diff Engine
//!
//! Compares two snapshots and produces the minimal set of property changes
//! that turns the first into the second.
//!
//! # Rules
//!
//! - A property is included iff its current value is not structurally equal
//!   to its previous value, or it did not exist before.
//! - A property that existed before but no longer does is included as
//!   [`Change::Removed`]. It is never silently dropped.
//! - Nested objects are never diffed into partial patches: if anything
//!   inside a sub-object changed, the whole sub-object is sent again.
//! - Numbers compare exactly. There is no epsilon for floats, and an
//!   integer is not equal to a float of the same magnitude.
//!
//! The engine is pure. Given the same two snapshots it always produces the
//! same diff, with keys in discovery order: changed or new properties in the
//! order of the current snapshot, then removed properties in the order of the
//! previous one.
//!
//! # Wire Form
//!
//! A diff serializes as a plain JSON object of property name to new value.
//! Removed properties carry the sentinel `{"$removed": true}`.

use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::observer::DirtyValues;
use super::Snapshot;

/// Key of the sentinel object that marks a removed property on the wire.
pub const REMOVED_KEY: &str = "$removed";

/// The change to a single property.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Set(Value),
    Removed,
}

/// Minimal mapping of changed property names to their new values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    changes: IndexMap<String, Change>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    /// A diff that sets every property of `snapshot`.
    ///
    /// This is what a client with no prior state receives.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            changes: snapshot
                .iter()
                .map(|(name, value)| (name.clone(), Change::Set(value.clone())))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, name: &str) -> Option<&Change> {
        self.changes.get(name)
    }

    /// New value of `name`, if the diff sets it.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.changes.get(name) {
            Some(Change::Set(value)) => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.changes.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, change: Change) {
        self.changes.insert(name.into(), change);
    }

    pub fn remove(&mut self, name: &str) -> Option<Change> {
        self.changes.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Change)> {
        self.changes.iter().map(|(name, change)| (name.as_str(), change))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    /// Patch `snapshot` in place with this diff.
    pub fn apply(&self, snapshot: &mut Snapshot) {
        for (name, change) in &self.changes {
            match change {
                Change::Set(value) => {
                    snapshot.insert(name.clone(), value.clone());
                }
                Change::Removed => {
                    snapshot.shift_remove(name);
                }
            }
        }
    }
}

/// Compute the changes that turn `previous` into `current`.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> Diff {
    let mut changes = IndexMap::new();

    for (name, value) in current {
        match previous.get(name) {
            Some(old) if structurally_equal(old, value) => {}
            _ => {
                changes.insert(name.clone(), Change::Set(value.clone()));
            }
        }
    }

    for name in previous.keys() {
        if !current.contains_key(name) {
            changes.insert(name.clone(), Change::Removed);
        }
    }

    Diff { changes }
}

/// Overlay freshly read dirty values onto a baseline snapshot.
pub fn merge(base: &Snapshot, dirty: DirtyValues) -> Snapshot {
    let mut merged = base.clone();
    for (name, value) in dirty {
        match value {
            Some(value) => {
                merged.insert(name, value);
            }
            None => {
                merged.shift_remove(&name);
            }
        }
    }
    merged
}

/// Structural equality of two property values.
///
/// Scalars compare by value, arrays element by element, objects key by key
/// regardless of key order.
pub fn structurally_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| structurally_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| structurally_equal(x, y)))
        }
        _ => a == b,
    }
}

#[derive(Serialize)]
struct RemovedMarker {
    #[serde(rename = "$removed")]
    removed: bool,
}

fn is_removed_marker(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.len() == 1 && map.get(REMOVED_KEY) == Some(&Value::Bool(true)),
        _ => false,
    }
}

impl Serialize for Diff {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.changes.len()))?;
        for (name, change) in &self.changes {
            match change {
                Change::Set(value) => map.serialize_entry(name, value)?,
                Change::Removed => map.serialize_entry(name, &RemovedMarker { removed: true })?,
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Diff {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = IndexMap::<String, Value>::deserialize(deserializer)?;
        let changes = raw
            .into_iter()
            .map(|(name, value)| {
                let change = if is_removed_marker(&value) {
                    Change::Removed
                } else {
                    Change::Set(value)
                };
                (name, change)
            })
            .collect();
        Ok(Self { changes })
    }
}
