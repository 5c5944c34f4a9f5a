//! Filter Pipeline
//!
//! Every exchange passes through an ordered chain of filters: once on the
//! way in, before the controller touches the instance, and once on the way
//! out, after the snapshot or diff has been computed. A filter can
//!
//! - inspect the exchange and pass it on,
//! - rewrite the inbound properties or the outbound diff,
//! - attach data (a principal, a raw token) for later filters and factories,
//! - short-circuit with a [`Rejection`].
//!
//! Both directions run in registration order, and every filter sees the
//! mutations made by the filters before it. The context lives for one
//! exchange and is dropped afterwards.

mod auth;
mod logging;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Rejection;
use crate::ids::{ConnectionId, InstanceId};
use crate::state::{Diff, Snapshot};
use crate::vm::AccessPolicy;

pub use auth::{AuthProvider, AuthorizeFilter, Claims, JwtAuthFilter, JwtAuthProvider, Principal};
pub use logging::LoggingFilter;

/// Attribute under which [`JwtAuthFilter`] stores the raw bearer token.
pub const ACCESS_TOKEN: &str = "access_token";

/// Kind of exchange a context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Request,
    Update,
    Push,
    Dispose,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Update => "update",
            Self::Push => "push",
            Self::Dispose => "dispose",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data threaded through one exchange.
#[derive(Debug)]
pub struct FilterContext<'a> {
    pub connection: ConnectionId,
    pub instance: &'a InstanceId,
    pub verb: Verb,
    /// Type name of the target instance.
    pub vm_type: &'a str,
    pub policy: AccessPolicy,
    /// Frame headers. Empty for pushes.
    pub headers: &'a HashMap<String, String>,
    pub principal: Option<Principal>,
    /// Properties carried by the client: the update payload, or the state
    /// a request resumes from.
    pub inbound: Snapshot,
    /// Payload about to go out. `None` during the inbound pass.
    pub outbound: Option<Diff>,
    pub attributes: HashMap<String, Value>,
}

impl<'a> FilterContext<'a> {
    pub fn new(
        connection: ConnectionId,
        instance: &'a InstanceId,
        verb: Verb,
        vm_type: &'a str,
        headers: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            connection,
            instance,
            verb,
            vm_type,
            policy: AccessPolicy::default(),
            headers,
            principal: None,
            inbound: Snapshot::new(),
            outbound: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_inbound(mut self, inbound: Snapshot) -> Self {
        self.inbound = inbound;
        self
    }

    /// Header lookup, ignoring ASCII case of the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// One interceptor in the pipeline.
///
/// Both hooks default to passing the exchange through untouched.
pub trait Filter: Send + Sync {
    /// Name used in logs and rejections.
    fn name(&self) -> &str;

    fn on_inbound(&self, _ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        Ok(())
    }

    fn on_outbound(&self, _ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        Ok(())
    }
}

type Hook = Box<dyn Fn(&mut FilterContext<'_>) -> Result<(), Rejection> + Send + Sync>;

/// Filter built from closures.
pub struct FnFilter {
    name: String,
    inbound: Option<Hook>,
    outbound: Option<Hook>,
}

impl FnFilter {
    /// Filter that only runs on the inbound pass.
    pub fn inbound<F>(name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut FilterContext<'_>) -> Result<(), Rejection> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inbound: Some(Box::new(hook)),
            outbound: None,
        }
    }

    /// Filter that only runs on the outbound pass.
    pub fn outbound<F>(name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut FilterContext<'_>) -> Result<(), Rejection> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inbound: None,
            outbound: Some(Box::new(hook)),
        }
    }

    /// Add an outbound hook to an inbound filter, or the reverse.
    pub fn and_outbound<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut FilterContext<'_>) -> Result<(), Rejection> + Send + Sync + 'static,
    {
        self.outbound = Some(Box::new(hook));
        self
    }
}

impl Filter for FnFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_inbound(&self, ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        match &self.inbound {
            Some(hook) => hook(ctx),
            None => Ok(()),
        }
    }

    fn on_outbound(&self, ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        match &self.outbound {
            Some(hook) => hook(ctx),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for FnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFilter").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Ordered chain of filters.
#[derive(Clone, Default)]
pub struct FilterPipeline {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter. Filters run in the order they were added.
    pub fn with(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn run_inbound(&self, ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        for filter in &self.filters {
            if let Err(rejection) = filter.on_inbound(ctx) {
                tracing::warn!(
                    filter = filter.name(),
                    instance = %ctx.instance,
                    verb = %ctx.verb,
                    detail = %rejection.detail,
                    "inbound rejected"
                );
                return Err(rejection);
            }
        }
        Ok(())
    }

    pub fn run_outbound(&self, ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        for filter in &self.filters {
            if let Err(rejection) = filter.on_outbound(ctx) {
                tracing::warn!(
                    filter = filter.name(),
                    instance = %ctx.instance,
                    verb = %ctx.verb,
                    detail = %rejection.detail,
                    "outbound rejected"
                );
                return Err(rejection);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.filters.iter().map(|filter| filter.name()))
            .finish()
    }
}
