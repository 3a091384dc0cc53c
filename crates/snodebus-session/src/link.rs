use std::future::Future;

use bytes::Bytes;
use snodebus_frame::{FrameError, Framer};
use snodebus_transport::{ByteSink, TransportError};
use tokio::sync::broadcast;

/// Packet-level seam the session runs on.
///
/// `send` writes one packet; `subscribe` observes every packet decoded
/// after the call. A receiver reporting closed means the link is gone.
pub trait PacketLink: Send + Sync + 'static {
    /// Frame and write one packet.
    fn send(&self, packet: &[u8]) -> impl Future<Output = Result<(), FrameError>> + Send;

    /// Subscribe to inbound packets.
    fn subscribe(&self) -> broadcast::Receiver<Bytes>;
}

impl<S> PacketLink for Framer<S>
where
    S: ByteSink<Error = TransportError> + 'static,
{
    fn send(&self, packet: &[u8]) -> impl Future<Output = Result<(), FrameError>> + Send {
        Framer::send(self, packet)
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        Framer::subscribe(self)
    }
}
