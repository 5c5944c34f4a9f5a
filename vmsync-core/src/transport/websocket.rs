//! WebSocket front end.
//!
//! Each accepted socket becomes one multiplexer connection. Frames go out as
//! text messages with the JSON codec and as binary messages with MessagePack.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::accept_async;

use super::{ChannelTransport, FrameCodec, Multiplexer};
use crate::error::SyncError;
use crate::ids::ConnectionId;

/// Accept WebSocket connections on `listener` until accepting fails.
///
/// `transport` must be the transport `mux` was built with.
pub async fn serve(
    listener: TcpListener,
    mux: Arc<Multiplexer>,
    transport: Arc<ChannelTransport>,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), codec = ?mux.codec(), "accepting websocket connections");

    loop {
        let (stream, peer) = listener.accept().await?;
        let mux = Arc::clone(&mux);
        let transport = Arc::clone(&transport);

        tokio::spawn(async move {
            if let Err(err) = run_connection(stream, mux, transport).await {
                tracing::warn!(%peer, error = %err, "websocket connection failed");
            }
        });
    }
}

async fn run_connection(
    stream: TcpStream,
    mux: Arc<Multiplexer>,
    transport: Arc<ChannelTransport>,
) -> Result<(), tungstenite::Error> {
    let socket = accept_async(stream).await?;
    let (mut sink, mut source) = socket.split();

    let connection = ConnectionId::next();
    let mut outgoing = transport.connect(connection);
    mux.open(connection);

    let binary = mux.codec() == FrameCodec::MessagePack;
    let writer = tokio::spawn(async move {
        while let Some(bytes) = outgoing.recv().await {
            let message = if binary {
                Message::Binary(bytes)
            } else {
                match String::from_utf8(bytes) {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        tracing::error!(%connection, error = %err, "json frame is not utf-8");
                        continue;
                    }
                }
            };
            if let Err(err) = sink.send(message).await {
                tracing::debug!(%connection, error = %err, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let result = loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => break Err(err),
            None => break Ok(()),
        };
        let bytes = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break Ok(()),
            _ => continue,
        };

        match mux.on_message(connection, &bytes) {
            Ok(()) => {}
            Err(SyncError::Transport(err)) => {
                tracing::debug!(%connection, error = %err, "connection lost");
                break Ok(());
            }
            Err(err) => tracing::warn!(%connection, error = %err, "inbound frame dropped"),
        }
    };

    mux.close(connection);
    transport.disconnect(connection);
    let _ = writer.await;
    result
}
