use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use snodebus_transport::{ByteSink, TransportError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use crate::codec::{encode_frame, FrameCodec, FRAME_OVERHEAD};
use crate::error::Result;

/// Default capacity of the packet broadcast channel.
pub const DEFAULT_PACKET_BUFFER: usize = 256;

/// Configuration for [`Framer`].
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Packets a slow subscriber may fall behind before it observes a lag.
    pub packet_buffer: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            packet_buffer: DEFAULT_PACKET_BUFFER,
        }
    }
}

type PacketSender = Arc<Mutex<Option<broadcast::Sender<Bytes>>>>;

/// Packet-level link over a byte transport.
///
/// Outbound payloads are framed and written to the sink as one buffer.
/// Inbound chunks are decoded by a background pump and published to every
/// subscriber. When the chunk stream ends the packet stream completes.
pub struct Framer<S> {
    sink: Arc<S>,
    packets: PacketSender,
    pump: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<S> Framer<S>
where
    S: ByteSink<Error = TransportError> + 'static,
{
    /// Start decoding `data` and return a framer writing into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<S>, data: mpsc::UnboundedReceiver<Bytes>, config: FrameConfig) -> Self {
        let (tx, _) = broadcast::channel(config.packet_buffer.max(1));
        let packets: PacketSender = Arc::new(Mutex::new(Some(tx)));
        let shutdown = CancellationToken::new();

        let span = tracing::debug_span!("framer");
        let handle = tokio::spawn(
            pump(data, Arc::clone(&packets), shutdown.clone()).instrument(span),
        );

        Self {
            sink,
            packets,
            pump: Mutex::new(Some(handle)),
            shutdown,
        }
    }

    /// Frame `payload` and write it to the sink.
    ///
    /// Fails with [`FrameError::PayloadTooLarge`](crate::FrameError::PayloadTooLarge)
    /// before touching the sink when the payload exceeds 255 bytes.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
        encode_frame(payload, &mut buf)?;
        self.sink.send(&buf).await?;
        trace!(len = payload.len(), "packet sent");
        Ok(())
    }

    /// Sink this framer writes into.
    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// Stop the decode pump. Subscribers observe the end of the stream.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = lock(&self.pump).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl<S> Framer<S> {
    /// Subscribe to decoded packets.
    ///
    /// Only packets decoded after this call are delivered. Once the pump has
    /// stopped the returned receiver reports closed immediately.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        match lock(&self.packets).as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// True while the decode pump is still publishing.
    pub fn is_running(&self) -> bool {
        lock(&self.packets).is_some()
    }
}

impl<S> ByteSink for Framer<S>
where
    S: ByteSink<Error = TransportError> + 'static,
{
    type Error = crate::FrameError;

    fn send(&self, bytes: &[u8]) -> impl std::future::Future<Output = Result<()>> + Send {
        Framer::send(self, bytes)
    }
}

impl<S> Drop for Framer<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<S> std::fmt::Debug for Framer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer")
            .field("running", &self.is_running())
            .finish()
    }
}

async fn pump(
    mut data: mpsc::UnboundedReceiver<Bytes>,
    packets: PacketSender,
    shutdown: CancellationToken,
) {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();

    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => break,
            chunk = data.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        buf.extend_from_slice(&chunk);

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(packet)) => {
                    trace!(len = packet.len(), "packet received");
                    if let Some(tx) = lock(&packets).as_ref() {
                        // No subscribers is not an error; the packet is simply unobserved.
                        let _ = tx.send(packet);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "frame decoder failed");
                    buf.clear();
                    break;
                }
            }
        }
    }

    lock(&packets).take();
    debug!(dropped = codec.dropped_frames(), "packet stream ended");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast::error::RecvError;

    use super::*;
    use crate::FrameError;

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl ByteSink for RecordingSink {
        type Error = TransportError;

        async fn send(&self, bytes: &[u8]) -> std::result::Result<(), TransportError> {
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    struct DownSink;

    impl ByteSink for DownSink {
        type Error = TransportError;

        async fn send(&self, _bytes: &[u8]) -> std::result::Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }
    }

    fn framer() -> (
        Framer<RecordingSink>,
        Arc<RecordingSink>,
        mpsc::UnboundedSender<Bytes>,
    ) {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let framer = Framer::spawn(Arc::clone(&sink), rx, FrameConfig::default());
        (framer, sink, tx)
    }

    async fn next(rx: &mut broadcast::Receiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("packet within timeout")
            .expect("packet stream open")
    }

    #[tokio::test]
    async fn send_writes_one_framed_buffer() {
        let (framer, sink, _tx) = framer();
        framer.send(&[0x91]).await.unwrap();
        framer.send(&[0x92, 0x00, 0x42]).await.unwrap();

        let writes = sink.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], vec![0xDE, 0x5B, 0x01, 0x91, 0x40, 0x17]);
        assert_eq!(&writes[1][..5], &[0xDE, 0x5B, 0x03, 0x92, 0x00]);
        assert_eq!(writes[1].len(), 3 + FRAME_OVERHEAD);
    }

    #[tokio::test]
    async fn oversized_payload_never_reaches_sink() {
        let (framer, sink, _tx) = framer();
        let err = framer.send(&[0u8; 256]).await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 256, .. }));
        assert!(sink.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sink_errors_surface_as_transport_errors() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let framer = Framer::spawn(Arc::new(DownSink), rx, FrameConfig::default());
        let err = framer.send(&[0x01]).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Transport(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn packets_split_across_chunks_are_published() {
        let (framer, _sink, tx) = framer();
        let mut first = framer.subscribe();
        let mut second = framer.subscribe();

        tx.send(Bytes::from_static(&[0x00, 0xDE, 0x5B, 0x01])).unwrap();
        tx.send(Bytes::from_static(&[0x91, 0x40])).unwrap();
        tx.send(Bytes::from_static(&[0x17, 0xDE, 0x5B, 0x00, 0x20, 0x42]))
            .unwrap();

        assert_eq!(next(&mut first).await.as_ref(), &[0x91]);
        assert!(next(&mut first).await.is_empty());
        assert_eq!(next(&mut second).await.as_ref(), &[0x91]);
        assert!(next(&mut second).await.is_empty());
    }

    #[tokio::test]
    async fn stream_completes_when_chunks_end() {
        let (framer, _sink, tx) = framer();
        let mut rx = framer.subscribe();

        drop(tx);
        let end = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(end, Err(RecvError::Closed)));
        assert!(!framer.is_running());

        let mut late = framer.subscribe();
        assert!(matches!(late.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_stops_the_pump() {
        let (framer, _sink, tx) = framer();
        let mut rx = framer.subscribe();

        framer.shutdown().await;
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        // Chunks after shutdown go nowhere.
        let _ = tx.send(Bytes::from_static(&[0xDE, 0x5B, 0x01, 0x91, 0x40, 0x17]));
        assert!(!framer.is_running());
    }

    #[tokio::test]
    async fn framer_is_a_byte_sink() {
        async fn via_sink<B: ByteSink>(sink: &B, bytes: &[u8]) {
            sink.send(bytes).await.ok();
        }

        let (framer, sink, _tx) = framer();
        via_sink(&framer, &[0x01, 0x02, 0x03]).await;
        assert_eq!(sink.writes.lock().unwrap()[0][2], 0x03);
    }
}
