//! View-Model Controller
//!
//! The controller turns one inbound frame (or one push signal) into at most
//! one outbound frame. Each exchange is self-contained: it looks the
//! instance up in the registry, holds the entry's critical section while it
//! works, and lets go before returning.
//!
//! # Exchanges
//!
//! | verb     | inbound filters | touches instance             | reply             |
//! |----------|-----------------|------------------------------|-------------------|
//! | request  | before resolve  | resolve, optional resume     | full snapshot     |
//! | update   | before lookup   | assign keys, take dirty set  | diff + key faults |
//! | push     | none            | take dirty set               | diff, if any      |
//! | dispose  | before lookup   | evict, dispose hook          | none              |
//!
//! A filter rejection aborts the exchange before the instance is touched
//! and always reads "access denied" on the wire. Filters see update and
//! dispose frames whether or not the id is live, so a rejection looks the
//! same either way. Stale references (update, push or dispose of an id
//! with no live instance) are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use super::registry::{Entry, EntryGuard, VmRegistry};
use super::{PushSignal, TypeCatalog, ViewModel, VmArgs};
use crate::error::{InstantiationError, PropertyError, PropertyFault, SyncError};
use crate::filter::{FilterContext, FilterPipeline, Verb};
use crate::ids::{ConnectionId, EntryKey, InstanceId};
use crate::state::{diff, find_property, merge, Diff, Snapshot};
use crate::transport::{Command, InboundFrame, OutboundFrame};

/// Per-connection context for the controller.
#[derive(Debug, Clone)]
pub struct Session {
    connection: ConnectionId,
    pushes: mpsc::UnboundedSender<InstanceId>,
}

impl Session {
    /// Create a session. The receiver yields the id of every instance that
    /// asks for a push.
    pub fn new(connection: ConnectionId) -> (Self, mpsc::UnboundedReceiver<InstanceId>) {
        let (pushes, rx) = mpsc::unbounded_channel();
        (Self { connection, pushes }, rx)
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    fn key(&self, instance: &InstanceId) -> EntryKey {
        EntryKey::new(self.connection, instance.clone())
    }

    fn push_signal(&self, instance: &InstanceId) -> PushSignal {
        PushSignal::new(instance.clone(), self.pushes.clone())
    }
}

/// Orchestrates request, update, push and dispose exchanges.
#[derive(Debug, Clone)]
pub struct VmController {
    registry: Arc<VmRegistry>,
    catalog: Arc<TypeCatalog>,
    pipeline: Arc<FilterPipeline>,
}

impl VmController {
    pub fn new(registry: Arc<VmRegistry>, catalog: TypeCatalog, pipeline: FilterPipeline) -> Self {
        Self {
            registry,
            catalog: Arc::new(catalog),
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn registry(&self) -> &Arc<VmRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    pub fn pipeline(&self) -> &FilterPipeline {
        &self.pipeline
    }

    /// Run one inbound exchange.
    pub fn handle(&self, session: &Session, frame: InboundFrame) -> Option<OutboundFrame> {
        let InboundFrame {
            instance_id,
            command,
            headers,
        } = frame;

        let verb = match &command {
            Command::Request { .. } => Verb::Request,
            Command::Update { .. } => Verb::Update,
            Command::Dispose => Verb::Dispose,
        };
        tracing::debug!(connection = %session.connection, instance = %instance_id, %verb, "exchange started");

        let reply = match command {
            Command::Request { type_name, state } => {
                self.request(session, &instance_id, &type_name, state, &headers)
            }
            Command::Update { properties } => self.update(session, &instance_id, properties, &headers),
            Command::Dispose => self.dispose(session, &instance_id, &headers),
        };

        tracing::debug!(
            connection = %session.connection,
            instance = %instance_id,
            %verb,
            reply = reply_kind(reply.as_ref()),
            "exchange finished"
        );
        reply
    }

    /// Send whatever changed since the last exchange, if anything did.
    pub fn push(&self, session: &Session, instance: &InstanceId) -> Option<OutboundFrame> {
        tracing::debug!(connection = %session.connection, %instance, verb = %Verb::Push, "exchange started");
        let key = session.key(instance);
        let entry = match self.registry.require(&key) {
            Ok(entry) => entry,
            Err(err) => {
                stale(&err, Verb::Push);
                return None;
            }
        };
        let mut guard = entry.lock()?;

        let data = commit_dirty(&mut guard);
        if data.is_empty() {
            return None;
        }

        let headers = HashMap::new();
        let mut ctx = FilterContext::new(session.connection, instance, Verb::Push, entry.type_name(), &headers)
            .with_policy(self.catalog.policy(entry.type_name()));
        ctx.outbound = Some(data);

        if let Err(rejection) = self.pipeline.run_outbound(&mut ctx) {
            return Some(OutboundFrame::reject(instance.clone(), rejection));
        }
        drop(guard);

        let data = ctx.outbound.take().unwrap_or_default();
        if data.is_empty() {
            return None;
        }
        tracing::trace!(key = %key, changes = data.len(), "push");
        Some(OutboundFrame::response(instance.clone(), data))
    }

    /// Register a pre-built instance under `instance`.
    ///
    /// If the id is already live the existing instance is kept and `vm` is
    /// dropped without being attached.
    pub fn inject(
        &self,
        session: &Session,
        instance: impl Into<InstanceId>,
        type_name: &str,
        vm: Box<dyn ViewModel>,
    ) -> Result<Arc<Entry>, InstantiationError> {
        let instance = instance.into();
        let key = session.key(&instance);
        self.registry
            .resolve(&key, type_name, session.push_signal(&instance), move || Ok(vm))
    }

    /// Dispose every instance owned by the session's connection.
    pub fn close(&self, session: &Session) -> usize {
        self.registry.evict_connection(session.connection)
    }

    fn request(
        &self,
        session: &Session,
        instance: &InstanceId,
        type_name: &str,
        state: Option<Snapshot>,
        headers: &HashMap<String, String>,
    ) -> Option<OutboundFrame> {
        let resume = state.is_some();
        let mut ctx = FilterContext::new(session.connection, instance, Verb::Request, type_name, headers)
            .with_policy(self.catalog.policy(type_name))
            .with_inbound(state.unwrap_or_default());

        if let Err(rejection) = self.pipeline.run_inbound(&mut ctx) {
            return Some(OutboundFrame::reject(instance.clone(), rejection));
        }

        let key = session.key(instance);
        let resolved = self
            .registry
            .resolve(&key, type_name, session.push_signal(instance), || {
                self.catalog.instantiate(&VmArgs {
                    instance,
                    type_name,
                    principal: ctx.principal.as_ref(),
                    attributes: &ctx.attributes,
                })
            });
        let entry = match resolved {
            Ok(entry) => entry,
            Err(err) => return Some(OutboundFrame::reject(instance.clone(), err)),
        };

        let Some(mut guard) = entry.lock() else {
            tracing::warn!(key = %key, "instance disposed during request");
            return None;
        };

        if resume {
            restore(&mut guard, &ctx.inbound);
        }

        let snapshot = guard.snapshot();
        let data = if resume {
            diff(&ctx.inbound, &snapshot)
        } else {
            Diff::from_snapshot(&snapshot)
        };

        ctx.outbound = Some(data);
        if let Err(rejection) = self.pipeline.run_outbound(&mut ctx) {
            return Some(OutboundFrame::reject(instance.clone(), rejection));
        }
        // Only state that actually went out becomes the baseline.
        guard.set_baseline(snapshot);
        drop(guard);

        Some(OutboundFrame::response(
            instance.clone(),
            ctx.outbound.take().unwrap_or_default(),
        ))
    }

    fn update(
        &self,
        session: &Session,
        instance: &InstanceId,
        properties: Snapshot,
        headers: &HashMap<String, String>,
    ) -> Option<OutboundFrame> {
        let key = session.key(instance);
        let found = self.registry.require(&key);
        let type_name = found.as_ref().map_or("", |entry| entry.type_name());

        let mut ctx = FilterContext::new(session.connection, instance, Verb::Update, type_name, headers)
            .with_policy(self.catalog.policy(type_name))
            .with_inbound(properties);

        if let Err(rejection) = self.pipeline.run_inbound(&mut ctx) {
            return Some(OutboundFrame::reject(instance.clone(), rejection));
        }

        let entry = match &found {
            Ok(entry) => entry,
            Err(err) => {
                stale(err, Verb::Update);
                return None;
            }
        };
        let Some(mut guard) = entry.lock() else {
            tracing::warn!(key = %key, "update for disposed instance ignored");
            return None;
        };
        entry.touch();

        let faults = assign(&mut guard, &ctx.inbound);
        ctx.outbound = Some(commit_dirty(&mut guard));

        if let Err(rejection) = self.pipeline.run_outbound(&mut ctx) {
            return Some(OutboundFrame::reject(instance.clone(), rejection));
        }

        Some(OutboundFrame::Response {
            instance_id: instance.clone(),
            data: ctx.outbound.take().unwrap_or_default(),
            errors: faults,
        })
    }

    fn dispose(
        &self,
        session: &Session,
        instance: &InstanceId,
        headers: &HashMap<String, String>,
    ) -> Option<OutboundFrame> {
        let key = session.key(instance);
        let found = self.registry.require(&key);
        let type_name = found.as_ref().map_or("", |entry| entry.type_name());

        let mut ctx = FilterContext::new(session.connection, instance, Verb::Dispose, type_name, headers)
            .with_policy(self.catalog.policy(type_name));
        if let Err(rejection) = self.pipeline.run_inbound(&mut ctx) {
            return Some(OutboundFrame::reject(instance.clone(), rejection));
        }

        if let Err(err) = &found {
            stale(err, Verb::Dispose);
            return None;
        }

        // Evict takes the entry lock itself.
        if self.registry.evict(&key) {
            tracing::debug!(key = %key, "instance disposed");
        }
        None
    }
}

fn stale(err: &SyncError, verb: Verb) {
    tracing::warn!(error = %err, %verb, "stale reference ignored");
}

fn reply_kind(reply: Option<&OutboundFrame>) -> &'static str {
    match reply {
        Some(frame) if frame.is_reject() => "reject",
        Some(_) => "response",
        None => "none",
    }
}

/// Apply client-supplied values key by key. Failed keys are reported and
/// skipped; the rest still apply.
fn assign(guard: &mut EntryGuard<'_>, properties: &Snapshot) -> Vec<PropertyFault> {
    let mut faults = Vec::new();

    for (name, value) in properties {
        match assign_one(guard, name, value) {
            Ok(()) => guard.observer().mark_changed(name),
            Err(err) => {
                tracing::debug!(property = %name, error = %err, "property rejected");
                faults.push(PropertyFault::from(&err));
            }
        }
    }
    faults
}

fn assign_one(guard: &mut EntryGuard<'_>, name: &str, value: &Value) -> Result<(), PropertyError> {
    let descriptor = find_property(guard.vm().properties(), name)
        .copied()
        .ok_or_else(|| PropertyError::Unknown(name.to_owned()))?;
    if !descriptor.writable {
        return Err(PropertyError::ReadOnly(name.to_owned()));
    }
    let value = descriptor.coerce(value.clone())?;
    guard.vm_mut().set_property(name, value)
}

/// Bring a fresh instance to the state a client already holds.
///
/// Only writable keys are applied. Everything else is the client's copy of
/// server-owned values and is left for the diff to correct.
fn restore(guard: &mut EntryGuard<'_>, state: &Snapshot) {
    for (name, value) in state {
        let writable = find_property(guard.vm().properties(), name).is_some_and(|d| d.writable);
        if !writable {
            continue;
        }
        if let Err(err) = assign_one(guard, name, value) {
            tracing::debug!(property = %name, error = %err, "resume value skipped");
        }
    }
    // Values the client already holds are not news.
    guard.take_dirty();
}

/// Fold the dirty set into the baseline and return what changed.
fn commit_dirty(guard: &mut EntryGuard<'_>) -> Diff {
    let dirty = guard.take_dirty();
    if dirty.is_empty() {
        return Diff::new();
    }
    let current = merge(guard.baseline(), dirty);
    let changes = diff(guard.baseline(), &current);
    guard.set_baseline(current);
    changes
}
