use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use snodebus_frame::MAX_PAYLOAD;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use crate::endpoint::Endpoint;
use crate::error::{Result, SessionError};
use crate::link::PacketLink;
use crate::opcode::{
    failure_reason, is_known_reply, INIT, INIT_ACK, KEY_LEN, MESSAGE_RECEIVED, MESSAGE_SENT_ACK,
    SEND_MESSAGE,
};
use crate::registry::{Registry, Slot};
use crate::retry::{send_and_wait_for, ReplyVerdict, RetryPolicy, DEFAULT_TIMEOUT, DEFAULT_TRIES};

/// Largest message an endpoint can send (frame payload minus opcode and id).
pub const MAX_MESSAGE_PAYLOAD: usize = MAX_PAYLOAD - 2;

/// Default capacity of the session-wide message broadcast.
pub const DEFAULT_MESSAGE_BUFFER: usize = 256;

// Handshakes before a send gives up on getting its endpoint an id.
const ASSIGN_ROUNDS: usize = 3;

/// Session behaviour.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transmissions per Send-Message before giving up.
    pub tries: usize,
    /// Wait for a reply, per attempt.
    pub timeout: Duration,
    /// Transmissions per Init. Handshake failures surface to the caller.
    pub init_tries: usize,
    /// Capacity of [`Session::subscribe_messages`].
    pub message_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tries: DEFAULT_TRIES,
            timeout: DEFAULT_TIMEOUT,
            init_tries: 1,
            message_buffer: DEFAULT_MESSAGE_BUFFER,
        }
    }
}

impl SessionConfig {
    fn send_policy(&self) -> RetryPolicy {
        RetryPolicy {
            tries: self.tries,
            timeout: self.timeout,
        }
    }

    fn init_policy(&self) -> RetryPolicy {
        RetryPolicy {
            tries: self.init_tries,
            timeout: self.timeout,
        }
    }
}

/// A message a node sent to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Id the message was addressed from at the time it arrived.
    pub id: u8,
    /// Message body without opcode and id.
    pub payload: Bytes,
}

/// Queued Send-Message request, resolved by the endpoint's worker.
pub(crate) struct SendRequest {
    pub id: u8,
    pub generation: u64,
    pub payload: Bytes,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Multiplexes virtual endpoints over one packet link.
///
/// Endpoints are numbered by their position in the registry. Any
/// registration or close invalidates the numbering, and the next send
/// re-runs the Init handshake before transmitting.
pub struct Session<L> {
    pub(crate) inner: Arc<Inner<L>>,
}

pub(crate) struct Inner<L> {
    link: Arc<L>,
    config: SessionConfig,
    pub(crate) registry: Arc<Mutex<Registry>>,
    // Write side held by a handshake, read side by every in-flight send.
    wire: Arc<RwLock<()>>,
    messages: broadcast::Sender<InboundMessage>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    span: tracing::Span,
}

impl<L> Clone for Session<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: PacketLink> Session<L> {
    /// Create a session over `link` and start demultiplexing inbound packets.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(link: Arc<L>, config: SessionConfig) -> Self {
        Self::with_span(link, config, tracing::info_span!("session"))
    }

    /// Create a session that logs under an explicit span.
    pub fn with_span(link: Arc<L>, config: SessionConfig, span: tracing::Span) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (messages, _) = broadcast::channel(config.message_buffer.max(1));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(
            dispatch(
                link.subscribe(),
                Arc::clone(&registry),
                messages.clone(),
                shutdown.clone(),
            )
            .instrument(span.clone()),
        );

        Self {
            inner: Arc::new(Inner {
                link,
                config,
                registry,
                wire: Arc::new(RwLock::new(())),
                messages,
                dispatcher: Mutex::new(Some(handle)),
                shutdown,
                span,
            }),
        }
    }

    /// Register an endpoint identified by a 16-byte `key`.
    ///
    /// The endpoint has no id until the next handshake, which runs lazily
    /// before its first send.
    pub fn register(&self, key: &[u8]) -> Result<Endpoint<L>> {
        self.check_open()?;
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| SessionError::InvalidKeyLength(key.len()))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let slot = lock(&self.inner.registry).insert(key, inbound_tx)?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!(parent: &self.inner.span, "endpoint", slot);
        tokio::spawn(
            run_worker(
                slot,
                queue_rx,
                Arc::clone(&self.inner.link),
                Arc::clone(&self.inner.registry),
                Arc::clone(&self.inner.wire),
                self.inner.config.send_policy(),
                self.inner.shutdown.clone(),
            )
            .instrument(span),
        );

        debug!(parent: &self.inner.span, slot, key = %hex::encode(key), "endpoint registered");
        Ok(Endpoint::new(self.clone(), slot, key, queue_tx, inbound_rx))
    }

    /// Run the Init handshake if the registry changed since the last one,
    /// or unconditionally when `force` is set.
    ///
    /// Concurrent callers are serialized; a caller that waited behind a
    /// successful handshake returns without sending another one.
    pub async fn init(&self, force: bool) -> Result<()> {
        self.check_open()?;
        if !force && !self.is_dirty() {
            return Ok(());
        }

        let _wire = self.inner.wire.write().await;
        self.check_open()?;
        let snapshot = {
            let registry = lock(&self.inner.registry);
            if !force && !registry.is_dirty() {
                return Ok(());
            }
            registry.snapshot()
        };

        let mut packet = Vec::with_capacity(2 + snapshot.keys.len() * KEY_LEN);
        packet.push(INIT);
        packet.push(snapshot.keys.len() as u8);
        for key in &snapshot.keys {
            packet.extend_from_slice(key);
        }

        let handshake = send_and_wait_for(
            &*self.inner.link,
            &packet,
            |reply| {
                if matches!(reply, [INIT_ACK]) {
                    ReplyVerdict::Success
                } else {
                    ReplyVerdict::Pending
                }
            },
            self.inner.config.init_policy(),
        );
        let result = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(SessionError::Closed),
            result = handshake => result,
        };

        match result {
            Ok(attempts) => {
                let generation = lock(&self.inner.registry).complete_handshake(&snapshot);
                debug!(
                    parent: &self.inner.span,
                    endpoints = snapshot.keys.len(),
                    generation,
                    attempts,
                    "handshake complete"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    parent: &self.inner.span,
                    endpoints = snapshot.keys.len(),
                    error = %err,
                    "handshake failed"
                );
                Err(err)
            }
        }
    }

    /// Make sure the endpoint at `slot` has an id, handshaking if needed.
    pub(crate) async fn assign(&self, slot: Slot) -> Result<(u8, u64)> {
        for _ in 0..ASSIGN_ROUNDS {
            self.init(false).await?;
            let resolved = lock(&self.inner.registry).resolve(slot);
            match resolved {
                // Registered while a handshake was already in flight.
                Err(SessionError::Unassigned) => continue,
                other => return other,
            }
        }
        Err(SessionError::Unassigned)
    }

    /// Link this session runs on.
    pub fn link(&self) -> &Arc<L> {
        &self.inner.link
    }
}

impl<L> Session<L> {
    /// Subscribe to every message received from any node.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.messages.subscribe()
    }

    /// True when the remote view of the registry is stale.
    pub fn is_dirty(&self) -> bool {
        lock(&self.inner.registry).is_dirty()
    }

    /// Number of completed handshakes.
    pub fn generation(&self) -> u64 {
        lock(&self.inner.registry).generation()
    }

    /// Number of live endpoints.
    pub fn endpoint_count(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    /// Configuration this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// True once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop the dispatcher and all endpoint workers.
    ///
    /// Pending and future sends fail with [`SessionError::Closed`] and every
    /// endpoint's `recv` ends.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        lock(&self.inner.registry).clear();
        let handle = lock(&self.inner.dispatcher).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(parent: &self.inner.span, "session closed");
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.inner.span
    }
}

impl<L> Drop for Inner<L> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<L> std::fmt::Debug for Session<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock(&self.inner.registry);
        f.debug_struct("Session")
            .field("endpoints", &registry.len())
            .field("dirty", &registry.is_dirty())
            .field("generation", &registry.generation())
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

/// Classify a reply to `0x92 id …`.
fn send_verdict(id: u8, reply: &[u8]) -> ReplyVerdict {
    let [opcode, reply_id, ..] = *reply else {
        return ReplyVerdict::Pending;
    };
    if reply_id != id {
        return ReplyVerdict::Pending;
    }
    if opcode == MESSAGE_SENT_ACK {
        return ReplyVerdict::Success;
    }
    match failure_reason(opcode) {
        Some(reason) if reason.is_retryable() => ReplyVerdict::Retry(reason),
        Some(reason) => ReplyVerdict::Fatal(reason),
        None => ReplyVerdict::Pending,
    }
}

async fn run_worker<L: PacketLink>(
    slot: Slot,
    mut queue: mpsc::UnboundedReceiver<SendRequest>,
    link: Arc<L>,
    registry: Arc<Mutex<Registry>>,
    wire: Arc<RwLock<()>>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => {
                    trace!("worker retired");
                    return;
                }
            },
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => Err(SessionError::Closed),
            result = deliver(&*link, &registry, &wire, policy, slot, &request) => result,
        };
        let _ = request.reply.send(result);
    }

    queue.close();
    while let Ok(request) = queue.try_recv() {
        let _ = request.reply.send(Err(SessionError::Closed));
    }
    trace!("worker stopped");
}

async fn deliver<L: PacketLink>(
    link: &L,
    registry: &Mutex<Registry>,
    wire: &RwLock<()>,
    policy: RetryPolicy,
    slot: Slot,
    request: &SendRequest,
) -> Result<()> {
    let _wire = wire.read().await;
    let id = lock(registry).confirm(slot, request.id, request.generation)?;

    let mut packet = Vec::with_capacity(2 + request.payload.len());
    packet.push(SEND_MESSAGE);
    packet.push(id);
    packet.extend_from_slice(&request.payload);

    let attempts =
        send_and_wait_for(link, &packet, |reply| send_verdict(id, reply), policy).await?;
    trace!(id, attempts, len = request.payload.len(), "message delivered");
    Ok(())
}

async fn dispatch(
    mut packets: broadcast::Receiver<Bytes>,
    registry: Arc<Mutex<Registry>>,
    messages: broadcast::Sender<InboundMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => break,
            packet = packets.recv() => match packet {
                Ok(packet) => packet,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dispatcher fell behind the packet stream");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        match packet.first().copied() {
            Some(MESSAGE_RECEIVED) if packet.len() >= 2 => {
                let id = packet[1];
                let payload = packet.slice(2..);
                let _ = messages.send(InboundMessage {
                    id,
                    payload: payload.clone(),
                });

                let routed = lock(&registry)
                    .route(id)
                    .is_some_and(|route| route.send(payload).is_ok());
                if routed {
                    trace!(id, len = packet.len() - 2, "message routed");
                } else {
                    debug!(id, "message for unknown id dropped");
                }
            }
            Some(opcode) if is_known_reply(opcode) => {
                trace!(opcode = format_args!("{opcode:#04x}"), "reply observed");
            }
            Some(opcode) => {
                debug!(
                    opcode = format_args!("{opcode:#04x}"),
                    len = packet.len(),
                    "unknown packet discarded"
                );
            }
            None => debug!("empty packet discarded"),
        }
    }
    debug!("dispatcher stopped");
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;

    #[test]
    fn send_replies_are_matched_by_id() {
        assert_eq!(send_verdict(3, &[0x94, 3]), ReplyVerdict::Success);
        assert_eq!(send_verdict(3, &[0x94, 4]), ReplyVerdict::Pending);
        assert_eq!(send_verdict(3, &[0x94]), ReplyVerdict::Pending);
        assert_eq!(send_verdict(3, &[0x91]), ReplyVerdict::Pending);
        assert_eq!(send_verdict(3, &[0x93, 3, 0x01]), ReplyVerdict::Pending);
    }

    #[test]
    fn failure_replies_are_classified() {
        assert_eq!(
            send_verdict(0, &[0x70, 0]),
            ReplyVerdict::Retry(FailureReason::Busy)
        );
        assert_eq!(
            send_verdict(0, &[0x73, 0]),
            ReplyVerdict::Retry(FailureReason::NoAck)
        );
        assert_eq!(
            send_verdict(0, &[0x71, 0]),
            ReplyVerdict::Fatal(FailureReason::InvalidSize)
        );
        assert_eq!(
            send_verdict(0, &[0x72, 0]),
            ReplyVerdict::Fatal(FailureReason::InvalidId)
        );
    }
}
