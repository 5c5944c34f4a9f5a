//! Connection Multiplexer
//!
//! One logical connection carries frames for many view-model instances. The
//! multiplexer gives every open connection a dispatcher task, and the
//! dispatcher gives every instance id a worker task:
//!
//! ```text
//!   on_message ──▶ inbox ──┐
//!                          ├──▶ dispatcher ──▶ worker("Person") ──▶ transport
//!   push signals ──────────┘              └──▶ worker("Clock")  ──▶ transport
//! ```
//!
//! A worker runs its jobs one after another, so frames for the same id
//! leave in the order they were produced. Workers for different ids run
//! concurrently and their frames interleave freely.
//!
//! A dispose retires the id's worker once the worker has drained its
//! queue. A frame for the same id arriving in the meantime gets a new
//! worker that waits for the retiring one to finish first.
//!
//! A failed send closes the connection: its instances are evicted and the
//! error is returned from the next `on_message` call for that connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{Command, FrameCodec, InboundFrame, OutboundFrame};
use super::Transport;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult, TransportError};
use crate::ids::{ConnectionId, EntryKey, InstanceId};
use crate::vm::{Session, VmController};

enum Job {
    Frame(InboundFrame),
    Push(InstanceId),
}

struct Worker {
    jobs: mpsc::UnboundedSender<Job>,
    task: JoinHandle<()>,
}

struct Connection {
    inbox: mpsc::UnboundedSender<InboundFrame>,
    closed: Arc<AtomicBool>,
}

struct Shared {
    controller: Arc<VmController>,
    transport: Arc<dyn Transport>,
    codec: FrameCodec,
    max_frame_bytes: usize,
    connections: DashMap<ConnectionId, Connection>,
    failures: DashMap<ConnectionId, TransportError>,
}

/// Routes frames between connections and the controller.
pub struct Multiplexer {
    shared: Arc<Shared>,
    sweeper: JoinHandle<()>,
}

impl Multiplexer {
    /// Create a multiplexer and start the registry's idle sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(controller: Arc<VmController>, transport: Arc<dyn Transport>, config: &SyncConfig) -> Self {
        let sweeper = controller.registry().spawn_sweeper(config.sweep_interval());
        Self {
            shared: Arc::new(Shared {
                controller,
                transport,
                codec: config.codec,
                max_frame_bytes: config.max_frame_bytes,
                connections: DashMap::new(),
                failures: DashMap::new(),
            }),
            sweeper,
        }
    }

    pub fn controller(&self) -> &Arc<VmController> {
        &self.shared.controller
    }

    pub fn codec(&self) -> FrameCodec {
        self.shared.codec
    }

    /// Open a connection under a fresh id.
    pub fn connect(&self) -> ConnectionId {
        let connection = ConnectionId::next();
        self.open(connection);
        connection
    }

    /// Start routing for `connection`. Opening an open connection is a no-op.
    pub fn open(&self, connection: ConnectionId) {
        let shared = &self.shared;
        let dashmap::mapref::entry::Entry::Vacant(slot) = shared.connections.entry(connection) else {
            tracing::warn!(%connection, "connection already open");
            return;
        };
        shared.failures.remove(&connection);

        let (inbox, frames) = mpsc::unbounded_channel();
        let (session, pushes) = Session::new(connection);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(dispatch(
            Arc::clone(shared),
            session,
            Arc::clone(&closed),
            frames,
            pushes,
        ));
        slot.insert(Connection { inbox, closed });
        tracing::info!(%connection, "connection opened");
    }

    /// Decode one frame and queue it for its instance.
    ///
    /// Returns the transport error that closed the connection, if a send
    /// failed since the last call.
    pub fn on_message(&self, connection: ConnectionId, bytes: &[u8]) -> SyncResult<()> {
        if let Some((_, err)) = self.shared.failures.remove(&connection) {
            return Err(err.into());
        }

        let frame = self.shared.codec.decode_inbound(bytes, self.shared.max_frame_bytes)?;
        let open = self
            .shared
            .connections
            .get(&connection)
            .ok_or(SyncError::UnknownConnection(connection))?;
        open.inbox
            .send(frame)
            .map_err(|_| SyncError::UnknownConnection(connection))
    }

    /// Stop routing for `connection` and dispose all of its instances.
    pub fn close(&self, connection: ConnectionId) -> bool {
        self.shared.close(connection)
    }

    pub fn is_open(&self, connection: ConnectionId) -> bool {
        self.shared.connections.contains_key(&connection)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("codec", &self.shared.codec)
            .field("connections", &self.shared.connections.len())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn close(&self, connection: ConnectionId) -> bool {
        let was_open = match self.connections.remove(&connection) {
            Some((_, open)) => {
                open.closed.store(true, Ordering::Release);
                true
            }
            None => false,
        };
        let disposed = self.controller.registry().evict_connection(connection);
        if was_open {
            tracing::info!(%connection, disposed, "connection closed");
        }
        was_open
    }

    fn deliver(&self, connection: ConnectionId, frame: &OutboundFrame) -> Result<(), TransportError> {
        let bytes = match self.codec.encode(frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(%connection, instance = %frame.instance_id(), error = %err, "encode failed");
                return Ok(());
            }
        };
        self.transport.send(connection, bytes)
    }

    fn fail(&self, connection: ConnectionId, err: TransportError) {
        tracing::error!(%connection, error = %err, "send failed, closing connection");
        self.failures.insert(connection, err);
        self.close(connection);
    }
}

/// Fan a connection's frames and push signals out to per-instance workers.
async fn dispatch(
    shared: Arc<Shared>,
    session: Session,
    closed: Arc<AtomicBool>,
    mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    mut pushes: mpsc::UnboundedReceiver<InstanceId>,
) {
    let mut workers: HashMap<InstanceId, Worker> = HashMap::new();
    // Workers that were sent a dispose and may still be draining.
    let mut retiring: HashMap<InstanceId, JoinHandle<()>> = HashMap::new();

    loop {
        let (instance, job) = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => (frame.instance_id.clone(), Job::Frame(frame)),
                None => break,
            },
            Some(instance) = pushes.recv() => (instance.clone(), Job::Push(instance)),
        };

        let disposing = matches!(&job, Job::Frame(InboundFrame { command: Command::Dispose, .. }));
        let worker = workers.entry(instance.clone()).or_insert_with(|| {
            let (jobs, rx) = mpsc::unbounded_channel();
            let previous = retiring.remove(&instance);
            let task = tokio::spawn(work(
                Arc::clone(&shared),
                session.clone(),
                Arc::clone(&closed),
                previous,
                rx,
            ));
            Worker { jobs, task }
        });
        if worker.jobs.send(job).is_err() {
            // The worker gave up after a failed send; the connection is
            // closing and the job has nowhere to go.
            workers.remove(&instance);
            continue;
        }
        if disposing {
            // Dropping the sender lets the worker exit after the dispose.
            if let Some(worker) = workers.remove(&instance) {
                retiring.retain(|_, task| !task.is_finished());
                retiring.insert(instance, worker.task);
            }
        }
    }
    tracing::trace!(connection = %session.connection(), "dispatcher stopped");
}

/// Run one instance's jobs in order, after `previous` has finished.
async fn work(
    shared: Arc<Shared>,
    session: Session,
    closed: Arc<AtomicBool>,
    previous: Option<JoinHandle<()>>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    let connection = session.connection();

    if let Some(previous) = previous {
        if let Err(err) = previous.await {
            tracing::error!(%connection, error = %err, "retired worker failed");
        }
    }

    while let Some(job) = jobs.recv().await {
        if closed.load(Ordering::Acquire) {
            break;
        }
        let (instance, reply) = match job {
            Job::Frame(frame) => (frame.instance_id.clone(), shared.controller.handle(&session, frame)),
            Job::Push(instance) => {
                let reply = shared.controller.push(&session, &instance);
                (instance, reply)
            }
        };
        // A request that resolved while the connection was closing is
        // not covered by the close sweep.
        if closed.load(Ordering::Acquire) {
            let key = EntryKey::new(connection, instance);
            if shared.controller.registry().evict(&key) {
                tracing::debug!(key = %key, "evicted instance created during close");
            }
            break;
        }
        let Some(reply) = reply else {
            continue;
        };
        if let Err(err) = shared.deliver(connection, &reply) {
            shared.fail(connection, err);
            break;
        }
    }
}
