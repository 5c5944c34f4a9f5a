//! Error Taxonomy
//!
//! Errors fall into four groups, and each group is handled differently:
//!
//! - **Fatal to one exchange** ([`InstantiationError`], [`Rejection`]): the
//!   exchange is aborted and a reject frame goes back to the client. Other
//!   instances on the same connection are unaffected.
//! - **Per key** ([`PropertyError`]): collected as [`PropertyFault`]s and
//!   reported next to an otherwise successful response.
//! - **Stale reference** ([`SyncError::InstanceNotFound`]): logged and
//!   treated as a no-op, since the remote side may already have disposed it.
//! - **Transport** ([`TransportError`]): surfaced to the multiplexer's caller
//!   and followed by cleanup of the connection's instances.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, EntryKey};
use crate::state::PropertyKind;

/// Boxed error returned by user code such as view-model factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for the multiplexer surface.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure to construct a view-model instance.
#[derive(Debug, thiserror::Error)]
pub enum InstantiationError {
    #[error("unknown view model type `{0}`")]
    UnknownType(String),

    #[error("factory for `{type_name}` failed: {source}")]
    Factory {
        type_name: String,
        #[source]
        source: BoxError,
    },

    #[error("factory for `{0}` panicked")]
    Panicked(String),
}

/// A single rejected key of an update.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropertyError {
    #[error("unknown property `{0}`")]
    Unknown(String),

    #[error("property `{0}` is read-only")]
    ReadOnly(String),

    #[error("cannot assign {found} to {expected} property `{name}`")]
    Coercion {
        name: String,
        expected: PropertyKind,
        found: &'static str,
    },
}

impl PropertyError {
    /// Name of the property the error refers to.
    pub fn property(&self) -> &str {
        match self {
            Self::Unknown(name) | Self::ReadOnly(name) => name,
            Self::Coercion { name, .. } => name,
        }
    }
}

/// Wire form of a [`PropertyError`], reported alongside a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyFault {
    pub property: String,
    pub error: String,
}

impl From<&PropertyError> for PropertyFault {
    fn from(err: &PropertyError) -> Self {
        Self {
            property: err.property().to_owned(),
            error: err.to_string(),
        }
    }
}

/// A filter short-circuited the exchange.
///
/// The wire text is always "access denied" no matter which filter rejected
/// or why; `detail` is for server-side logs only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("access denied")]
pub struct Rejection {
    pub filter: String,
    pub detail: String,
}

impl Rejection {
    pub fn new(filter: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            detail: detail.into(),
        }
    }
}

/// Credential validation failure.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credential presented")]
    Missing,

    #[error("malformed authorization header")]
    Malformed,

    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("principal is not permitted")]
    Forbidden,
}

/// Frame encoding or decoding failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

/// The transport could not deliver a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("transport i/o: {0}")]
    Io(String),
}

/// Configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level error for the multiplexer and registry surface.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Instantiation(#[from] InstantiationError),

    #[error("no live instance for {0}")]
    InstanceNotFound(EntryKey),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_hides_detail_on_the_wire() {
        let rejection = Rejection::new("authorize", "missing role `admin`");
        assert_eq!(rejection.to_string(), "access denied");
        assert_eq!(rejection.detail, "missing role `admin`");
    }

    #[test]
    fn property_fault_keeps_the_key() {
        let err = PropertyError::Coercion {
            name: "Age".into(),
            expected: PropertyKind::Integer,
            found: "string",
        };
        let fault = PropertyFault::from(&err);
        assert_eq!(fault.property, "Age");
        assert_eq!(fault.error, "cannot assign string to integer property `Age`");
    }
}
