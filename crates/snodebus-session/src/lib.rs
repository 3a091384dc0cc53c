//! Virtual endpoints over one framed bus link.
//!
//! Many logical nodes share a single physical link. Each registers with a
//! 16-byte key and receives a small integer id from the Init handshake,
//! which the bus master uses to address it. Ids are registry positions, so
//! any registration or close renumbers everyone; the session re-runs the
//! handshake lazily before the next send and tags every queued send with
//! the registry generation it was addressed under.
//!
//! Packets (payloads inside frames):
//!
//! | Opcode | Direction | Body |
//! |--------|-----------|------|
//! | `0x90` | host → master | count, count × 16-byte key |
//! | `0x91` | master → host | (none) |
//! | `0x92` | host → master | id, message |
//! | `0x93` | master → host | id, message |
//! | `0x94` | master → host | id |
//! | `0x70`–`0x73` | master → host | id (busy, invalid size, invalid id, no ack) |

pub mod endpoint;
pub mod error;
pub mod link;
pub mod opcode;
mod registry;
pub mod retry;
pub mod session;

pub use endpoint::Endpoint;
pub use error::{FailureReason, Result, SessionError};
pub use link::PacketLink;
pub use registry::MAX_ENDPOINTS;
pub use retry::{send_and_wait_for, ReplyVerdict, RetryPolicy, DEFAULT_TIMEOUT, DEFAULT_TRIES};
pub use session::{
    InboundMessage, Session, SessionConfig, DEFAULT_MESSAGE_BUFFER, MAX_MESSAGE_PAYLOAD,
};
