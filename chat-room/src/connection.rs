//! Per-client read and write loops bridging a WebSocket and the hub.

use std::fmt::Display;

use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, warn};

use crate::{
    hub::{Client, ClientId, Hub},
    queue::OutboundQueue,
};

/// Runs one client for the lifetime of its socket.
///
/// Joins the hub, spawns the write loop and drives the read loop on the
/// current task. Returns once both loops have finished.
pub async fn serve_socket(socket: WebSocket, hub: Hub, queue_capacity: usize) {
    let (client, outbound) = Client::new(queue_capacity);
    let id = client.id();
    hub.join(client);

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound, hub.clone(), id));

    read_loop(stream, &hub, id).await;

    if let Err(err) = writer.await {
        warn!(client = %id, error = ?err, "write loop panicked");
    }
}

/// Leaves the hub when dropped, whichever way the read loop exits.
struct LeaveOnDrop<'a> {
    hub: &'a Hub,
    id: ClientId,
}

impl Drop for LeaveOnDrop<'_> {
    fn drop(&mut self) {
        self.hub.leave(self.id);
    }
}

/// Forwards every inbound text or binary frame to the hub until the peer
/// closes the socket or a read fails.
pub async fn read_loop<S, E>(mut stream: S, hub: &Hub, id: ClientId)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let _leave = LeaveOnDrop { hub, id };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => hub.broadcast(Bytes::from(text)),
            Ok(Message::Binary(data)) => hub.broadcast(Bytes::from(data)),
            // Ping replies are queued by the WebSocket layer itself.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(client = %id, "peer closed the connection");
                break;
            }
            Err(err) => {
                debug!(client = %id, error = %err, "failed to read from client");
                break;
            }
        }
    }
}

/// Writes queued messages to the socket until the hub closes the queue.
pub async fn write_loop<S>(mut sink: S, mut outbound: OutboundQueue, hub: Hub, id: ClientId)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(message) = outbound.dequeue().await {
        if let Err(err) = sink.send(into_frame(message)).await {
            debug!(client = %id, error = %err, "failed to write to client");
            hub.leave(id);
            return;
        }
    }

    // Queue closed by leave or eviction.
    if let Err(err) = sink.send(Message::Close(None)).await {
        debug!(client = %id, error = %err, "failed to send close frame");
    }
}

fn into_frame(message: Bytes) -> Message {
    match std::str::from_utf8(&message) {
        Ok(text) => Message::Text(text.to_owned()),
        Err(_) => Message::Binary(message.to_vec()),
    }
}
