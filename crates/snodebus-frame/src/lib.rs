//! Packet framing over the bus byte stream.
//!
//! Every packet travels as:
//! - a 2-byte sync marker `0xDE 0x5B`
//! - a 1-byte payload length
//! - up to 255 payload bytes
//! - a 2-byte big-endian rolling checksum over length + payload
//!
//! The decoder is a byte-at-a-time state machine: it survives arbitrary
//! chunk boundaries and resynchronizes on garbage. Frames with a bad
//! checksum are dropped silently.

pub mod checksum;
pub mod codec;
pub mod error;
pub mod framer;

pub use checksum::{checksum, verify, CHECKSUM_SEED};
pub use codec::{encode_frame, FrameCodec, FRAME_OVERHEAD, MAX_PAYLOAD, SYNC};
pub use error::{FrameError, Result};
pub use framer::{FrameConfig, Framer, DEFAULT_PACKET_BUFFER};
