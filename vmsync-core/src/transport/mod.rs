//! Transport Plumbing
//!
//! - `protocol`: inbound and outbound frames, and the codecs that carry them
//! - `mux`: the multiplexer routing many instances over one connection
//! - `websocket`: a ready-made WebSocket front end (feature `websocket`)
//!
//! The multiplexer only ever talks to a [`Transport`], an opaque sink of
//! encoded frames keyed by connection. Delivery, retries and backoff all
//! belong to the transport.

mod mux;
mod protocol;
#[cfg(feature = "websocket")]
mod websocket;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::ids::ConnectionId;

pub use mux::Multiplexer;
pub use protocol::{Command, FrameCodec, InboundFrame, OutboundFrame};
#[cfg(feature = "websocket")]
pub use websocket::serve;

/// Outbound half of the underlying duplex channel.
pub trait Transport: Send + Sync + 'static {
    /// Hand one encoded frame to the connection.
    fn send(&self, connection: ConnectionId, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// In-memory transport: every connection is an unbounded channel.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    peers: DashMap<ConnectionId, mpsc::UnboundedSender<Vec<u8>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiving end of its frames.
    ///
    /// Registering an id again replaces the previous receiver.
    pub fn connect(&self, connection: ConnectionId) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(connection, tx);
        rx
    }

    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        self.peers.remove(&connection).is_some()
    }

    pub fn is_connected(&self, connection: ConnectionId) -> bool {
        self.peers.contains_key(&connection)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, connection: ConnectionId, frame: Vec<u8>) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get(&connection)
            .ok_or(TransportError::Closed(connection))?;
        peer.send(frame).map_err(|_| TransportError::Closed(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_transport_delivers_per_connection() {
        let transport = ChannelTransport::new();
        let (a, b) = (ConnectionId::from(1), ConnectionId::from(2));
        let mut rx_a = transport.connect(a);
        let mut rx_b = transport.connect(b);

        transport.send(a, b"one".to_vec()).unwrap();
        transport.send(b, b"two".to_vec()).unwrap();

        assert_eq!(rx_a.try_recv().unwrap(), b"one");
        assert_eq!(rx_b.try_recv().unwrap(), b"two");
    }

    #[test]
    fn sending_to_a_gone_peer_fails() {
        let transport = ChannelTransport::new();
        let conn = ConnectionId::from(3);

        assert_eq!(transport.send(conn, vec![]), Err(TransportError::Closed(conn)));

        let rx = transport.connect(conn);
        drop(rx);
        assert_eq!(transport.send(conn, vec![]), Err(TransportError::Closed(conn)));

        assert!(transport.disconnect(conn));
        assert!(!transport.is_connected(conn));
    }
}
