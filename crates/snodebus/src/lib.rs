//! Host-side bridge to a serial field bus reached through a telnet server.
//!
//! Virtual nodes register with a 16-byte key, get a one-byte id from the
//! bus master during the Init handshake and then exchange short messages
//! with their peers on the bus.
//!
//! # Crate Structure
//!
//! - [`transport`]: reconnecting telnet transport, baud negotiation, keep-alive
//! - [`frame`]: `DE 5B` framing with the rotating checksum
//! - [`session`]: id handshake, endpoints, send-and-wait-for-reply with retries
//! - [`Bridge`]: the three layers wired together from a [`BridgeConfig`]
//! - [`sim`]: a bus master emulator for tests and bench work
//!
//! ```no_run
//! # async fn demo() -> snodebus::Result<()> {
//! let bridge = snodebus::Bridge::start(snodebus::BridgeConfig::new("192.168.1.40")).await?;
//! let node = bridge.register(&[0x11; 16])?;
//! node.send(&[0x01, 0x02]).await?;
//! if let Some(reply) = node.recv().await {
//!     println!("{reply:?}");
//! }
//! bridge.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod sim;

/// Re-export transport types.
pub mod transport {
    pub use snodebus_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use snodebus_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use snodebus_session::*;
}

pub use bridge::{Bridge, BusEndpoint, BusLink, BusSession};
pub use config::{parse_key, BridgeConfig, EndpointConfig, KEY_LEN};
pub use error::{BridgeError, Result};
pub use sim::{SimConfig, SimEvent, SimReply, Simulator};
