//! State Observer
//!
//! The observer sits next to a view-model instance and records which of its
//! named properties changed since the last time someone asked. It never
//! inspects the instance beyond the [`ViewModel`] capability surface.
//!
//! # How Changes Are Recorded
//!
//! 1. The controller marks every key it successfully assigns during an
//!    update.
//!
//! 2. The instance marks anything else it mutates on its own (for example
//!    from a timer) through the [`ChangeTracker`] it received in
//!    [`ViewModel::attach`].
//!
//! 3. Marking a property also marks every property declared as derived from
//!    it, using the type's [`PropertyGraph`].
//!
//! # Thread Safety
//!
//! The dirty set is shared between the controller (which holds the entry's
//! critical section) and the instance's own background tasks, so it lives
//! behind a mutex in an `Arc`. The lock is held only to insert or drain
//! names, never while reading property values.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::Value;

use super::graph::PropertyGraph;
use super::{PropertyDescriptor, Snapshot};
use crate::vm::ViewModel;

/// Values of the properties that were dirty, in the order they were marked.
///
/// `None` means the instance no longer exposes the property.
pub type DirtyValues = IndexMap<String, Option<Value>>;

struct TrackerInner {
    graph: PropertyGraph,
    dirty: Mutex<IndexSet<String>>,
}

/// Shareable handle to an instance's dirty set.
#[derive(Clone)]
pub struct ChangeTracker {
    inner: Arc<TrackerInner>,
}

impl ChangeTracker {
    fn new(graph: PropertyGraph) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                graph,
                dirty: Mutex::new(IndexSet::new()),
            }),
        }
    }

    /// Mark `name` and everything derived from it as changed.
    pub fn mark_changed(&self, name: &str) {
        let dependents = self.inner.graph.dependents_of(name);

        let mut dirty = self.inner.dirty.lock();
        dirty.insert(name.to_owned());
        for dependent in dependents {
            // Re-marking moves nothing: first discovery decides the order.
            dirty.insert(dependent.to_owned());
        }
    }

    /// Check whether anything is marked.
    pub fn is_dirty(&self) -> bool {
        !self.inner.dirty.lock().is_empty()
    }

    /// Drain the dirty set.
    fn take(&self) -> IndexSet<String> {
        std::mem::take(&mut *self.inner.dirty.lock())
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("dirty", &*self.inner.dirty.lock())
            .finish()
    }
}

/// Change observer for one view-model instance.
#[derive(Debug)]
pub struct Observer {
    tracker: ChangeTracker,
}

impl Observer {
    /// Create an observer for an instance with the given property table.
    pub fn new(table: &[PropertyDescriptor]) -> Self {
        Self {
            tracker: ChangeTracker::new(PropertyGraph::from_descriptors(table)),
        }
    }

    /// Handle the instance keeps to mark its own changes.
    pub fn tracker(&self) -> ChangeTracker {
        self.tracker.clone()
    }

    pub fn mark_changed(&self, name: &str) {
        self.tracker.mark_changed(name);
    }

    pub fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    /// Read the current value of every dirty property and clear the marks.
    pub fn take_dirty(&self, vm: &dyn ViewModel) -> DirtyValues {
        self.tracker
            .take()
            .into_iter()
            .map(|name| {
                let value = vm.get_property(&name);
                (name, value)
            })
            .collect()
    }

    /// Read every observable property, regardless of dirty state.
    ///
    /// Properties are listed in declaration order. A property the instance
    /// cannot currently produce is left out.
    pub fn snapshot(&self, vm: &dyn ViewModel) -> Snapshot {
        vm.properties()
            .iter()
            .filter_map(|descriptor| {
                vm.get_property(descriptor.name)
                    .map(|value| (descriptor.name.to_owned(), value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PropertyError;
    use crate::state::PropertyKind;
    use serde_json::json;

    const TABLE: &[PropertyDescriptor] = &[
        PropertyDescriptor::new("FirstName", PropertyKind::String),
        PropertyDescriptor::new("LastName", PropertyKind::String),
        PropertyDescriptor::derived("FullName", PropertyKind::String, &["FirstName", "LastName"]),
    ];

    struct Person {
        first: String,
        last: String,
    }

    impl ViewModel for Person {
        fn properties(&self) -> &[PropertyDescriptor] {
            TABLE
        }

        fn get_property(&self, name: &str) -> Option<Value> {
            match name {
                "FirstName" => Some(json!(self.first)),
                "LastName" => Some(json!(self.last)),
                "FullName" => Some(json!(format!("{} {}", self.first, self.last))),
                _ => None,
            }
        }

        fn set_property(&mut self, name: &str, value: Value) -> Result<(), PropertyError> {
            let text = value.as_str().unwrap_or_default().to_owned();
            match name {
                "FirstName" => self.first = text,
                "LastName" => self.last = text,
                _ => return Err(PropertyError::Unknown(name.to_owned())),
            }
            Ok(())
        }
    }

    fn person() -> Person {
        Person {
            first: "Hello".into(),
            last: "World".into(),
        }
    }

    #[test]
    fn snapshot_reads_every_property_in_order() {
        let vm = person();
        let observer = Observer::new(TABLE);

        let snapshot = observer.snapshot(&vm);
        let keys: Vec<_> = snapshot.keys().map(String::as_str).collect();
        assert_eq!(keys, ["FirstName", "LastName", "FullName"]);
        assert_eq!(snapshot["FullName"], json!("Hello World"));
    }

    #[test]
    fn marking_propagates_to_derived_properties() {
        let mut vm = person();
        let observer = Observer::new(TABLE);
        assert!(!observer.is_dirty());

        vm.set_property("FirstName", json!("John")).unwrap();
        observer.mark_changed("FirstName");
        assert!(observer.is_dirty());

        let dirty = observer.take_dirty(&vm);
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty["FirstName"], Some(json!("John")));
        assert_eq!(dirty["FullName"], Some(json!("John World")));
    }

    #[test]
    fn take_dirty_clears_the_marks() {
        let vm = person();
        let observer = Observer::new(TABLE);

        observer.mark_changed("LastName");
        assert_eq!(observer.take_dirty(&vm).len(), 2);
        assert!(observer.take_dirty(&vm).is_empty());
    }

    #[test]
    fn tracker_clones_share_the_dirty_set() {
        let vm = person();
        let observer = Observer::new(TABLE);
        let tracker = observer.tracker();

        std::thread::spawn(move || tracker.mark_changed("FullName"))
            .join()
            .unwrap();

        let dirty = observer.take_dirty(&vm);
        assert_eq!(dirty.keys().collect::<Vec<_>>(), ["FullName"]);
    }

    #[test]
    fn unreadable_dirty_property_is_reported_as_absent() {
        let vm = person();
        let observer = Observer::new(TABLE);

        observer.mark_changed("Nickname");
        let dirty = observer.take_dirty(&vm);
        assert_eq!(dirty["Nickname"], None);
    }
}
