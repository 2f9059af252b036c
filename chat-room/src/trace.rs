//! Diagnostic tracing of hub activity.
//!
//! A [`Tracer`] is handed to the hub when it is spawned and receives one
//! [`TraceEvent`] per membership change or delivery attempt. The default
//! [`NoopTracer`] discards everything, so tracing never changes behavior.

use std::{fmt, io::Write, sync::Mutex};

use axum::body::Bytes;

use crate::hub::ClientId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Joined { client: ClientId },
    Left { client: ClientId },
    Received { message: Bytes },
    Delivered { client: ClientId },
    Evicted { client: ClientId },
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Joined { client } => write!(f, "{client} joined"),
            TraceEvent::Left { client } => write!(f, "{client} left"),
            TraceEvent::Received { message } => {
                write!(f, "message received: {}", String::from_utf8_lossy(message))
            }
            TraceEvent::Delivered { client } => write!(f, "-- sent to {client}"),
            TraceEvent::Evicted { client } => {
                write!(f, "-- failed to send to {client}, evicted")
            }
        }
    }
}

pub trait Tracer: Send + Sync {
    fn trace(&self, event: &TraceEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn trace(&self, _event: &TraceEvent) {}
}

/// Writes one line per event to the wrapped writer.
///
/// Write failures are ignored: a broken trace output must not affect the hub.
/// Writes are synchronous and run on the hub task, so a writer that blocks
/// (a stdout pipe nobody reads) stalls the hub. Whoever consumes the output
/// must keep draining it; use [`LogTracer`] when that cannot be guaranteed.
pub struct WriterTracer<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> WriterTracer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> Tracer for WriterTracer<W> {
    fn trace(&self, event: &TraceEvent) {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(out, "{event}");
        let _ = out.flush();
    }
}

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn trace(&self, event: &TraceEvent) {
        tracing::debug!(target: "chat_room::trace", "{event}");
    }
}
