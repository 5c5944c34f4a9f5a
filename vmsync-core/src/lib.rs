//! vmsync Core
//!
//! Server-side view models kept in sync with their remote clients over one
//! persistent connection per client. The crate implements:
//!
//! - Dirty tracking and dependency propagation for view-model properties
//! - A pure diff engine over property snapshots
//! - A registry owning every live instance, with idle eviction
//! - A controller running request, update, push and dispose exchanges
//! - A filter pipeline wrapped around every exchange
//! - A multiplexer routing many instances over a single connection
//!
//! # Architecture
//!
//! - `state`: snapshots, diffs, property descriptors, the observer
//! - `vm`: the [`ViewModel`] trait, type catalog, registry, controller
//! - `filter`: the filter pipeline and the built-in auth and logging filters
//! - `transport`: wire frames, codecs, the multiplexer, WebSocket serving
//!
//! Control flow for one inbound frame:
//!
//! ```text
//! Multiplexer ─▶ inbound filters ─▶ Controller ─▶ Registry / Observer
//!      ▲                                              │
//!      └──────── outbound filters ◀── Diff Engine ◀───┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmsync_core::{
//!     ChannelTransport, FilterPipeline, Multiplexer, SyncConfig, TypeCatalog,
//!     VmController, VmRegistry,
//! };
//!
//! let config = SyncConfig::default();
//! let catalog = TypeCatalog::builder()
//!     .register("HelloWorld", |_| Ok(Box::new(HelloWorld::default())))
//!     .build();
//! let registry = Arc::new(VmRegistry::from_config(&config));
//! let controller = Arc::new(VmController::new(registry, catalog, FilterPipeline::new()));
//!
//! let transport = Arc::new(ChannelTransport::new());
//! let mux = Multiplexer::new(controller, transport.clone(), &config);
//!
//! let connection = mux.connect();
//! let mut outgoing = transport.connect(connection);
//! mux.on_message(connection, br#"{"instanceId":"hw","verb":"request","typeName":"HelloWorld"}"#)?;
//! let snapshot = outgoing.recv().await;
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod ids;
pub mod state;
pub mod transport;
pub mod vm;

pub use config::SyncConfig;
pub use error::{
    AuthError, BoxError, CodecError, ConfigError, InstantiationError, PropertyError, PropertyFault, Rejection,
    SyncError, SyncResult, TransportError,
};
pub use filter::{
    AuthProvider, AuthorizeFilter, Filter, FilterContext, FilterPipeline, FnFilter, JwtAuthFilter, JwtAuthProvider,
    LoggingFilter, Principal, Verb,
};
pub use ids::{ConnectionId, EntryKey, InstanceId};
pub use state::{Change, Diff, PropertyDescriptor, PropertyKind, Snapshot};
pub use transport::{
    ChannelTransport, Command, FrameCodec, InboundFrame, Multiplexer, OutboundFrame, Transport,
};
pub use vm::{AccessPolicy, Session, TypeCatalog, ViewModel, VmArgs, VmController, VmHandle, VmRegistry};
