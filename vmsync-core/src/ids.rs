//! Identifiers used on the wire and in the registry.
//!
//! An [`InstanceId`] is the client-chosen address of one view-model instance.
//! It is only unique within a single connection, so the registry keys its
//! entries by [`EntryKey`], the pair of connection and instance id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique identifier for a logical connection.
///
/// Allocated from a process-wide atomic counter, so two connections never
/// share an id even if the transport reuses its own handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh connection id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque address of a view-model instance on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry key: an instance id scoped to the connection that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub connection: ConnectionId,
    pub instance: InstanceId,
}

impl EntryKey {
    pub fn new(connection: ConnectionId, instance: impl Into<InstanceId>) -> Self {
        Self {
            connection,
            instance: instance.into(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let id1 = ConnectionId::next();
        let id2 = ConnectionId::next();
        let id3 = ConnectionId::next();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn instance_id_is_transparent_on_the_wire() {
        let id = InstanceId::new("HelloWorld.1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"HelloWorld.1\"");

        let back: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn entry_keys_are_scoped_by_connection() {
        let a = EntryKey::new(ConnectionId::from(1), "vm");
        let b = EntryKey::new(ConnectionId::from(2), "vm");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "conn-1/vm");
    }
}
