//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use vmsync_core::{
    ConnectionId, FilterPipeline, InboundFrame, InstanceId, OutboundFrame, PropertyDescriptor, PropertyError,
    PropertyKind, Session, Snapshot, TypeCatalog, ViewModel, VmController, VmHandle, VmRegistry,
};
use vmsync_core::vm::AccessPolicy;

/// Send library logs to the test output. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const HELLO_WORLD: &[PropertyDescriptor] = &[
    PropertyDescriptor::new("FirstName", PropertyKind::String),
    PropertyDescriptor::new("LastName", PropertyKind::String),
    PropertyDescriptor::derived("FullName", PropertyKind::String, &["FirstName", "LastName"]),
];

/// Two names and their concatenation.
pub struct HelloWorld {
    first_name: String,
    last_name: String,
    disposed: Arc<AtomicUsize>,
}

impl HelloWorld {
    pub fn new(disposed: Arc<AtomicUsize>) -> Self {
        Self {
            first_name: "Hello".into(),
            last_name: "World".into(),
            disposed,
        }
    }
}

impl ViewModel for HelloWorld {
    fn properties(&self) -> &[PropertyDescriptor] {
        HELLO_WORLD
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        match name {
            "FirstName" => Some(json!(self.first_name)),
            "LastName" => Some(json!(self.last_name)),
            "FullName" => Some(json!(format!("{} {}", self.first_name, self.last_name))),
            _ => None,
        }
    }

    fn set_property(&mut self, name: &str, value: Value) -> Result<(), PropertyError> {
        let text = value.as_str().unwrap_or_default().to_owned();
        match name {
            "FirstName" => self.first_name = text,
            "LastName" => self.last_name = text,
            _ => return Err(PropertyError::Unknown(name.to_owned())),
        }
        Ok(())
    }

    fn dispose(&mut self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

pub const LIVE_DATA: &[PropertyDescriptor] = &[PropertyDescriptor::read_only("Data", PropertyKind::Integer)];

/// Interval between [`LiveData`] ticks.
pub const TICK: Duration = Duration::from_millis(200);

/// Bumps `Data` and asks for a push on every tick.
pub struct LiveData {
    data: Arc<AtomicI64>,
    ticker: Option<JoinHandle<()>>,
    disposed: Arc<AtomicUsize>,
}

impl LiveData {
    pub fn new(disposed: Arc<AtomicUsize>) -> Self {
        Self {
            data: Arc::new(AtomicI64::new(0)),
            ticker: None,
            disposed,
        }
    }
}

impl ViewModel for LiveData {
    fn properties(&self) -> &[PropertyDescriptor] {
        LIVE_DATA
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        (name == "Data").then(|| json!(self.data.load(Ordering::SeqCst)))
    }

    fn set_property(&mut self, name: &str, _value: Value) -> Result<(), PropertyError> {
        Err(PropertyError::ReadOnly(name.to_owned()))
    }

    fn attach(&mut self, handle: VmHandle) {
        let data = Arc::clone(&self.data);
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            loop {
                interval.tick().await;
                data.fetch_add(1, Ordering::SeqCst);
                handle.changed("Data");
                if !handle.push_updates() {
                    break;
                }
            }
        }));
    }

    fn dispose(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Dispose counters shared with the catalog's factories.
#[derive(Clone, Default)]
pub struct Disposals {
    pub hello_world: Arc<AtomicUsize>,
    pub live_data: Arc<AtomicUsize>,
}

impl Disposals {
    pub fn total(&self) -> usize {
        self.hello_world.load(Ordering::SeqCst) + self.live_data.load(Ordering::SeqCst)
    }
}

/// Catalog with `HelloWorld`, `LiveData` and an authenticated `SecureHelloWorld`.
pub fn catalog(disposals: &Disposals) -> TypeCatalog {
    let hello = Arc::clone(&disposals.hello_world);
    let secure = Arc::clone(&disposals.hello_world);
    let live = Arc::clone(&disposals.live_data);

    TypeCatalog::builder()
        .register("HelloWorld", move |_| Ok(Box::new(HelloWorld::new(Arc::clone(&hello)))))
        .register_with_policy("SecureHelloWorld", AccessPolicy::Authenticated, move |_| {
            Ok(Box::new(HelloWorld::new(Arc::clone(&secure))))
        })
        .register("LiveData", move |_| Ok(Box::new(LiveData::new(Arc::clone(&live)))))
        .build()
}

pub fn controller(pipeline: FilterPipeline, disposals: &Disposals) -> VmController {
    let registry = Arc::new(VmRegistry::new(Duration::from_secs(60)));
    VmController::new(registry, catalog(disposals), pipeline)
}

pub fn props(pairs: &[(&str, Value)]) -> Snapshot {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// A controller session that drives exchanges directly and drains push
/// signals the way the multiplexer would.
pub struct MockSession {
    pub controller: VmController,
    pub session: Session,
    pushes: mpsc::UnboundedReceiver<InstanceId>,
}

impl MockSession {
    pub fn new(controller: VmController) -> Self {
        init_tracing();
        let (session, pushes) = Session::new(ConnectionId::next());
        Self {
            controller,
            session,
            pushes,
        }
    }

    pub fn send(&self, frame: InboundFrame) -> Option<OutboundFrame> {
        self.controller.handle(&self.session, frame)
    }

    pub fn request(&self, instance: &str, type_name: &str) -> Option<OutboundFrame> {
        self.send(InboundFrame::request(instance, type_name))
    }

    pub fn update(&self, instance: &str, properties: Snapshot) -> Option<OutboundFrame> {
        self.send(InboundFrame::update(instance, properties))
    }

    pub fn dispose(&self, instance: &str) -> Option<OutboundFrame> {
        self.send(InboundFrame::dispose(instance))
    }

    /// Wait for the next push signal and run the push exchange for it.
    pub async fn next_push(&mut self) -> Option<OutboundFrame> {
        let instance = self.pushes.recv().await?;
        self.controller.push(&self.session, &instance)
    }
}
