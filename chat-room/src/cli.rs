use std::net::SocketAddr;

use clap::{Parser, ValueEnum, builder::RangedU64ValueParser};

use crate::server::RoomConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address to serve the chat page and room on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Messages buffered per client before a slow client is evicted.
    #[arg(long, default_value_t = 256, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub queue_capacity: usize,

    /// WebSocket write buffer size in bytes (reads use the default buffer).
    #[arg(long, default_value_t = 1024, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub socket_buffer_size: usize,

    /// Trace every room event (joins, leaves, deliveries, evictions).
    #[arg(long, value_enum)]
    pub trace: Option<TraceTarget>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceTarget {
    /// One plain line per event on stdout.
    Stdout,
    /// Debug-level `tracing` events under the `chat_room::trace` target.
    Log,
}

impl Cli {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            queue_capacity: self.queue_capacity,
            socket_buffer_size: self.socket_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_room_config() {
        let cli = Cli::try_parse_from(["chat_room"]).expect("defaults parse");
        assert_eq!(cli.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(cli.room_config(), RoomConfig::default());
        assert_eq!(cli.trace, None);
    }

    #[test]
    fn parses_trace_target() {
        let cli = Cli::try_parse_from(["chat_room", "--trace", "log"]).expect("trace parses");
        assert_eq!(cli.trace, Some(TraceTarget::Log));
    }

    #[test]
    fn rejects_zero_queue_capacity() {
        let result = Cli::try_parse_from(["chat_room", "--queue-capacity", "0"]);
        assert!(result.is_err());
    }
}
