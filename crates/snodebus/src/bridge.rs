use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use snodebus_frame::{FrameConfig, Framer};
use snodebus_session::{Endpoint, InboundMessage, Session};
use snodebus_transport::{spawn_heartbeat, TelnetTransport};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Packet link used by a bridge: frames over the telnet transport.
pub type BusLink = Framer<TelnetTransport>;
/// Session running on a [`BusLink`].
pub type BusSession = Session<BusLink>;
/// Endpoint registered through a [`Bridge`].
pub type BusEndpoint = Endpoint<BusLink>;

/// The three layers wired together, plus keep-alive and reconnect handling.
///
/// Every transition to connected forces a fresh Init handshake, since the
/// bus master may have lost its id table while the link was down.
pub struct Bridge {
    config: BridgeConfig,
    transport: Arc<TelnetTransport>,
    framer: Arc<BusLink>,
    session: BusSession,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Bridge {
    /// Build the stack for `config` and start connecting.
    ///
    /// A failed first connection attempt is logged, not returned; the
    /// transport keeps retrying in the background. Use
    /// [`wait_connected`](Self::wait_connected) to block until the link is up.
    pub async fn start(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let span = tracing::info_span!("bridge", host = %config.host, port = config.port);
        let transport = Arc::new(TelnetTransport::with_span(
            config.transport_config(),
            span.clone(),
        ));
        let data = transport.take_data().ok_or(BridgeError::Closed)?;
        let framer = Arc::new(Framer::spawn(
            Arc::clone(&transport),
            data,
            FrameConfig::default(),
        ));
        let session = Session::with_span(Arc::clone(&framer), config.session_config(), span.clone());
        let shutdown = CancellationToken::new();

        let heartbeat = spawn_heartbeat(
            Arc::clone(&framer),
            transport.connected(),
            config.heartbeat_config(),
            shutdown.clone(),
        );
        let reinit = tokio::spawn(
            reinit_on_connect(session.clone(), transport.connected(), shutdown.clone())
                .instrument(span.clone()),
        );

        let bridge = Self {
            config,
            transport,
            framer,
            session,
            tasks: Mutex::new(vec![heartbeat, reinit]),
            shutdown,
        };

        match bridge.transport.open().await {
            Ok(()) => info!(parent: &span, "connected"),
            Err(err) => warn!(parent: &span, error = %err, "initial connect failed, retrying"),
        }
        Ok(bridge)
    }

    /// Register a virtual node by its 16-byte key.
    pub fn register(&self, key: &[u8]) -> Result<BusEndpoint> {
        Ok(self.session.register(key)?)
    }

    /// Register every endpoint listed in the configuration, in order.
    pub fn register_configured(&self) -> Result<Vec<(String, BusEndpoint)>> {
        self.config
            .endpoint_keys()?
            .into_iter()
            .map(|(name, key)| self.register(&key).map(|endpoint| (name, endpoint)))
            .collect()
    }

    /// The session multiplexing endpoints over this bridge.
    pub fn session(&self) -> &BusSession {
        &self.session
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<TelnetTransport> {
        &self.transport
    }

    /// Every message received from any node.
    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.session.subscribe_messages()
    }

    /// Watch the link state.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.transport.connected()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Resolve once the link is up, or fail after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.transport.connected();
        let outcome = tokio::time::timeout(timeout, state.wait_for(|up| *up)).await;
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => Err(BridgeError::Timeout(timeout)),
        }
    }

    /// Shut down every layer, top to bottom.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.session.close().await;
        self.transport.close().await;
        self.framer.shutdown().await;

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            let _ = task.await;
        }
        debug!(host = %self.config.host, "bridge closed");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("transport", &self.transport)
            .field("session", &self.session)
            .finish()
    }
}

async fn reinit_on_connect(
    session: BusSession,
    mut connected: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = connected.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let up = *connected.borrow_and_update();
        if !up {
            continue;
        }

        match session.init(true).await {
            Ok(()) => debug!(endpoints = session.endpoint_count(), "re-initialized after connect"),
            Err(err) => warn!(error = %err, "handshake after connect failed"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
