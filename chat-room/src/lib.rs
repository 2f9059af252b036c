//! Single-room WebSocket chat that fans every message out to all participants.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`hub`] owns the live set of clients and serializes joins, leaves and
//!   broadcasts through one task, evicting clients that fall behind.
//! - [`queue`] is the bounded per-client outbound queue the hub feeds.
//! - [`connection`] runs the read and write loops for one WebSocket.
//! - [`server`] serves the chat page and upgrades `/room` requests.
//! - [`trace`] provides the optional diagnostic tracer handed to the hub.
//! - [`cli`] parses the command-line flags into a [`server::RoomConfig`].
//!
//! Unit tests exercise the hub directly; integration tests drive a real
//! server over WebSockets.

pub mod cli;
pub mod connection;
pub mod hub;
pub mod queue;
pub mod server;
pub mod trace;
