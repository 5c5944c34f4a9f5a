//! View-Model State
//!
//! This module holds everything that deals with the *values* of a view
//! model, independent of how instances are stored or how frames travel:
//!
//! - `property`: static property descriptors and value coercion
//! - `graph`: declared dependencies between derived and source properties
//! - `observer`: dirty tracking and full snapshots of one instance
//! - `diff`: the pure diff engine comparing two snapshots
//!
//! # Concepts
//!
//! ## Snapshot
//!
//! A point-in-time mapping of property name to JSON value. Snapshots are
//! plain values; once taken they are never mutated behind anyone's back.
//!
//! ## Diff
//!
//! The minimal set of changes between two snapshots. A property missing
//! from a diff is guaranteed unchanged since the reference snapshot.

mod diff;
mod graph;
mod observer;
mod property;

use indexmap::IndexMap;
use serde_json::Value;

pub use diff::{diff, merge, structurally_equal, Change, Diff, REMOVED_KEY};
pub use graph::PropertyGraph;
pub use observer::{ChangeTracker, DirtyValues, Observer};
pub use property::{find as find_property, json_type_name, PropertyDescriptor, PropertyKind};

/// Point-in-time mapping of property name to value, in declaration order.
pub type Snapshot = IndexMap<String, Value>;
