//! Byte transport for the serial field bus.
//!
//! The bus is reached through a telnet server that bridges a TCP socket to
//! a serial line. This crate owns that connection:
//! - `0xFF` (telnet IAC) escaping on every outbound write
//! - RFC 2217 style line-speed negotiation after each connect
//! - automatic reconnect on a fixed interval, forever
//! - a periodic keep-alive driver over any [`ByteSink`]
//!
//! This is the lowest layer of snodebus. Framing and sessions build on the
//! [`ByteSink`] seam and the raw chunk receiver provided here.

pub mod error;
pub mod heartbeat;
pub mod telnet;
pub mod traits;

pub use error::{Result, TransportError};
pub use heartbeat::{spawn_heartbeat, HeartbeatConfig, HEARTBEAT_PAYLOAD};
pub use telnet::{
    baud_negotiation, escape_iac, TelnetTransport, TransportConfig, DEFAULT_BAUD_RATE,
    DEFAULT_PORT, DEFAULT_RECONNECT_INTERVAL,
};
pub use traits::ByteSink;
