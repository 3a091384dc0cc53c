use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::link::PacketLink;
use crate::opcode::KEY_LEN;
use crate::registry::Slot;
use crate::session::{lock, SendRequest, Session, MAX_MESSAGE_PAYLOAD};

/// Handle to one registered virtual node.
///
/// Sends on one endpoint are delivered strictly in order, one at a time.
/// Dropping the handle closes the endpoint.
pub struct Endpoint<L> {
    session: Session<L>,
    slot: Slot,
    key: [u8; KEY_LEN],
    queue: Mutex<Option<mpsc::UnboundedSender<SendRequest>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl<L> Endpoint<L> {
    pub(crate) fn new(
        session: Session<L>,
        slot: Slot,
        key: [u8; KEY_LEN],
        queue: mpsc::UnboundedSender<SendRequest>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            session,
            slot,
            key,
            queue: Mutex::new(Some(queue)),
            inbound: tokio::sync::Mutex::new(inbound),
        }
    }

    /// Receive the next message addressed to this endpoint's current id.
    ///
    /// Returns `None` once the endpoint or its session is closed and every
    /// buffered message has been taken.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    /// Id assigned by the last handshake, if any.
    pub fn id(&self) -> Option<u8> {
        lock(&self.session.inner.registry).id_of(self.slot)
    }

    /// The 16-byte key this endpoint was registered with.
    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// True once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        lock(&self.queue).is_none()
    }

    /// Remove the endpoint from the registry.
    ///
    /// Sends already queued still resolve; new sends fail with
    /// [`SessionError::EndpointClosed`]. The next send on any other
    /// endpoint re-runs the handshake.
    pub fn close(&self) {
        let Some(queue) = lock(&self.queue).take() else {
            return;
        };
        drop(queue);
        lock(&self.session.inner.registry).remove(self.slot);
        debug!(parent: self.session.span(), slot = self.slot, "endpoint closed");
    }
}

impl<L: PacketLink> Endpoint<L> {
    /// Deliver `payload` to the node, resolving once the bus master
    /// acknowledged it.
    ///
    /// Runs the handshake first when the registry changed since the last
    /// one. Busy, no-ack and timeout replies are retried; invalid id and
    /// invalid size fail immediately.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let queue = lock(&self.queue)
            .clone()
            .ok_or(SessionError::EndpointClosed)?;
        if payload.len() > MAX_MESSAGE_PAYLOAD {
            return Err(SessionError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_PAYLOAD,
            });
        }

        let (id, generation) = self.session.assign(self.slot).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        queue
            .send(SendRequest {
                id,
                generation,
                payload: Bytes::copy_from_slice(payload),
                reply: reply_tx,
            })
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Session this endpoint belongs to.
    pub fn session(&self) -> &Session<L> {
        &self.session
    }
}

impl<L> Drop for Endpoint<L> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<L> std::fmt::Debug for Endpoint<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("key", &hex::encode(self.key))
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
