//! View Models
//!
//! A view model is a server-side object with named, observable properties.
//! This module defines the capability surface every view-model type
//! implements, plus the machinery that hosts instances:
//!
//! - `catalog`: type names to factories, with per-type access policies
//! - `registry`: the process-wide map of live instances
//! - `controller`: orchestration of request, update, push and dispose
//!
//! # The Capability Interface
//!
//! Instances are never inspected through reflection. Each type implements
//! [`ViewModel`] by hand: it lists its properties, reads and writes them by
//! name, and optionally keeps the [`VmHandle`] it is given on attach so it
//! can report its own changes and ask for a push.
//!
//! # Pushes
//!
//! An instance that changes on its own (a timer, an external event) marks
//! the affected properties through its handle and then calls
//! [`VmHandle::push_updates`]. That sends the instance id down the owning
//! session's push channel; whoever drains the channel (normally the
//! multiplexer) calls back into the controller. The instance never calls
//! the controller directly, so a push requested from inside a setter cannot
//! deadlock on the instance's own critical section.

mod catalog;
mod controller;
mod registry;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::PropertyError;
use crate::ids::InstanceId;
use crate::state::{ChangeTracker, PropertyDescriptor};

pub use catalog::{AccessPolicy, Factory, Registration, TypeCatalog, TypeCatalogBuilder, VmArgs};
pub use controller::{Session, VmController};
pub use registry::{Entry, EntryGuard, VmRegistry};

/// Capability surface of a view-model instance.
pub trait ViewModel: Send + 'static {
    /// Static table of observable properties.
    fn properties(&self) -> &[PropertyDescriptor];

    /// Current value of a property, or `None` if the instance does not
    /// expose it (any more).
    fn get_property(&self, name: &str) -> Option<Value>;

    /// Assign an already coerced value to a writable property.
    ///
    /// The controller marks `name` as changed after a successful call.
    /// Derived properties are marked through their declared dependencies.
    fn set_property(&mut self, name: &str, value: Value) -> Result<(), PropertyError>;

    /// Called once, right after construction, with the handle the instance
    /// uses to report changes and request pushes.
    fn attach(&mut self, _handle: VmHandle) {}

    /// Release timers, subscriptions and anything else the instance holds.
    ///
    /// Runs synchronously, exactly once, before the instance is dropped.
    fn dispose(&mut self) {}
}

/// Sender half of a session's push channel, bound to one instance.
#[derive(Debug, Clone)]
pub struct PushSignal {
    instance: InstanceId,
    tx: mpsc::UnboundedSender<InstanceId>,
}

impl PushSignal {
    pub fn new(instance: InstanceId, tx: mpsc::UnboundedSender<InstanceId>) -> Self {
        Self { instance, tx }
    }

    /// Ask for a push. Returns false once the session is gone.
    pub fn signal(&self) -> bool {
        self.tx.send(self.instance.clone()).is_ok()
    }
}

/// What an instance receives on attach.
#[derive(Debug, Clone)]
pub struct VmHandle {
    instance: InstanceId,
    changes: ChangeTracker,
    push: PushSignal,
}

impl VmHandle {
    pub(crate) fn new(instance: InstanceId, changes: ChangeTracker, push: PushSignal) -> Self {
        Self {
            instance,
            changes,
            push,
        }
    }

    /// Id of the instance this handle belongs to.
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Mark a property (and everything derived from it) as changed.
    pub fn changed(&self, name: &str) {
        self.changes.mark_changed(name);
    }

    /// Ask the controller to push pending changes to the client.
    ///
    /// Returns false if the owning session has closed.
    pub fn push_updates(&self) -> bool {
        self.push.signal()
    }
}
