use axum::body::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Outcome of a non-blocking enqueue onto a client's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// The queue is at capacity; the consumer is not keeping up.
    Full,
    /// The consumer half has been dropped.
    Closed,
}

/// Creates a bounded outbound queue.
///
/// The producer half belongs to the hub and the consumer half to the client's
/// write loop. Dropping the producer closes the queue; the consumer still
/// drains whatever was buffered before it observes the close.
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundQueue) {
    // tokio panics on a zero-capacity channel.
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OutboundSender { tx }, OutboundQueue { rx })
}

#[derive(Debug)]
pub struct OutboundSender {
    tx: mpsc::Sender<Bytes>,
}

impl OutboundSender {
    pub fn try_enqueue(&self, message: Bytes) -> Enqueue {
        match self.tx.try_send(message) {
            Ok(()) => Enqueue::Accepted,
            Err(TrySendError::Full(_)) => Enqueue::Full,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Closes the queue. Consuming `self` makes a second close impossible.
    pub fn close(self) {
        drop(self);
    }
}

#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Bytes>,
}

impl OutboundQueue {
    /// Waits for the next message. `None` means closed and fully drained.
    pub async fn dequeue(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_dequeue(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}
