use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use crate::error::{Result, TransportError};
use crate::traits::ByteSink;

/// Telnet "interpret as command" byte.
pub const IAC: u8 = 0xFF;
/// Telnet WILL.
pub const WILL: u8 = 0xFB;
/// Telnet sub-negotiation begin.
pub const SB: u8 = 0xFA;
/// Telnet sub-negotiation end.
pub const SE: u8 = 0xF0;
/// COM port control option (RFC 2217).
pub const COM_PORT_OPTION: u8 = 0x2C;
/// COM port SET-BAUDRATE sub-command.
pub const SET_BAUDRATE: u8 = 0x01;

/// Default telnet port.
pub const DEFAULT_PORT: u16 = 23;
/// Default serial line speed requested after connecting.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;
/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Configuration for [`TelnetTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Telnet server host name or address.
    pub host: String,
    /// Telnet server port.
    pub port: u16,
    /// Line speed requested via COM-PORT-OPTION after each connect.
    pub baud_rate: u32,
    /// Send `IAC WILL COM-PORT-OPTION` before the baud sub-negotiation.
    pub announce_com_port: bool,
    /// Delay before a reconnect attempt.
    pub reconnect_interval: Duration,
    /// Upper bound on a single TCP connect attempt.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// Configuration for `host:port` with default timings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// The `host:port` address to connect to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            baud_rate: DEFAULT_BAUD_RATE,
            announce_com_port: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Append `data` to `dst`, doubling every IAC byte.
pub fn escape_iac(data: &[u8], dst: &mut BytesMut) {
    let escapes = data.iter().filter(|&&byte| byte == IAC).count();
    dst.reserve(data.len() + escapes);
    for &byte in data {
        dst.put_u8(byte);
        if byte == IAC {
            dst.put_u8(IAC);
        }
    }
}

/// Build the line-speed negotiation sequence sent after each connect.
///
/// ```text
/// [IAC WILL COM-PORT]  IAC SB COM-PORT SET-BAUDRATE <baud: u32 BE> IAC SE
/// ```
pub fn baud_negotiation(baud_rate: u32, announce_com_port: bool) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    if announce_com_port {
        buf.put_slice(&[IAC, WILL, COM_PORT_OPTION]);
    }
    buf.put_slice(&[IAC, SB, COM_PORT_OPTION, SET_BAUDRATE]);
    escape_iac(&baud_rate.to_be_bytes(), &mut buf);
    buf.put_slice(&[IAC, SE]);
    buf
}

/// A reconnecting TCP connection to a telnet serial bridge.
///
/// Once [`open`](Self::open)ed, a background supervisor keeps the
/// connection up: it connects, negotiates the line speed, publishes
/// `connected = true`, pumps received chunks into the data channel, and on
/// any error or EOF publishes `connected = false` and tries again after
/// [`TransportConfig::reconnect_interval`]. It only stops on
/// [`close`](Self::close) or when the transport is dropped.
pub struct TelnetTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state_rx: watch::Receiver<bool>,
    // Moved into the supervisor on open; dropping them completes the streams.
    state_tx: Mutex<Option<watch::Sender<bool>>>,
    data_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    data_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    span: tracing::Span,
}

impl TelnetTransport {
    /// Create a transport. Nothing is connected until [`open`](Self::open).
    pub fn new(config: TransportConfig) -> Self {
        let span = tracing::info_span!("transport", host = %config.host, port = config.port);
        Self::with_span(config, span)
    }

    /// Create a transport that logs under an explicit span.
    pub fn with_span(config: TransportConfig, span: tracing::Span) -> Self {
        let (state_tx, state_rx) = watch::channel(false);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                writer: tokio::sync::Mutex::new(None),
                state_rx,
                state_tx: Mutex::new(Some(state_tx)),
                data_tx: Mutex::new(Some(data_tx)),
                data_rx: Mutex::new(Some(data_rx)),
                supervisor: Mutex::new(None),
                shutdown: CancellationToken::new(),
                span,
            }),
        }
    }

    /// Start the connection supervisor.
    ///
    /// Resolves with the outcome of the first connection attempt. When that
    /// attempt fails the supervisor keeps retrying in the background.
    pub async fn open(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        let state_tx = lock(&self.inner.state_tx).take();
        let data_tx = lock(&self.inner.data_tx).take();
        let (state_tx, data_tx) = match (state_tx, data_tx) {
            (Some(state_tx), Some(data_tx)) => (state_tx, data_tx),
            _ => return Err(TransportError::AlreadyOpen),
        };

        let (first_tx, first_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let span = self.inner.span.clone();
        let handle = tokio::spawn(supervise(inner, state_tx, data_tx, first_tx).instrument(span));
        *lock(&self.inner.supervisor) = Some(handle);

        first_rx.await.unwrap_or(Err(TransportError::Shutdown))
    }

    /// Escape and write `data`, resolving once it is flushed.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        let connected = *self.inner.state_rx.borrow();
        if !connected {
            return Err(TransportError::NotConnected);
        }

        let mut escaped = BytesMut::new();
        escape_iac(data, &mut escaped);

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        writer.write_all(&escaped).await?;
        writer.flush().await?;
        trace!(parent: &self.inner.span, len = data.len(), wire_len = escaped.len(), "sent");
        Ok(())
    }

    /// Take the receiver of raw inbound chunks.
    ///
    /// The receiver spans reconnects and ends when the transport is closed.
    /// Returns `None` once it has been taken.
    pub fn take_data(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        lock(&self.inner.data_rx).take()
    }

    /// Watch the connection state. Only changes are published.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.state_rx.clone()
    }

    /// Current connection state.
    pub fn is_connected(&self) -> bool {
        *self.inner.state_rx.borrow()
    }

    /// Configuration this transport was created with.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Tear down the socket, cancel any pending reconnect and complete the
    /// data and state streams.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        // Never opened: drop the senders here instead.
        drop(lock(&self.inner.state_tx).take());
        drop(lock(&self.inner.data_tx).take());

        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(parent: &self.inner.span, "transport closed");
    }
}

impl ByteSink for TelnetTransport {
    type Error = TransportError;

    fn send(&self, bytes: &[u8]) -> impl std::future::Future<Output = Result<()>> + Send {
        TelnetTransport::send(self, bytes)
    }
}

impl Drop for TelnetTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for TelnetTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelnetTransport")
            .field("addr", &self.inner.config.addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn supervise(
    inner: Arc<Inner>,
    state: watch::Sender<bool>,
    data: mpsc::UnboundedSender<Bytes>,
    first: oneshot::Sender<Result<()>>,
) {
    let mut first = Some(first);
    loop {
        let attempt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = connect(&inner.config) => result,
        };

        match attempt {
            Ok((reader, writer)) => {
                *inner.writer.lock().await = Some(writer);
                set_state(&state, true);
                info!("connected");
                if let Some(first) = first.take() {
                    let _ = first.send(Ok(()));
                }

                let outcome = tokio::select! {
                    _ = inner.shutdown.cancelled() => None,
                    result = pump(reader, &data) => Some(result),
                };
                inner.writer.lock().await.take();
                set_state(&state, false);
                match outcome {
                    None => break,
                    Some(Ok(())) => warn!("disconnected from server"),
                    Some(Err(err)) => warn!(error = %err, "connection error"),
                }
            }
            Err(err) => {
                set_state(&state, false);
                warn!(error = %err, "connect failed");
                if let Some(first) = first.take() {
                    let _ = first.send(Err(err));
                }
            }
        }

        debug!(interval = ?inner.config.reconnect_interval, "scheduling reconnect");
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.config.reconnect_interval) => {}
        }
    }

    inner.writer.lock().await.take();
    set_state(&state, false);
    debug!("supervisor stopped");
}

async fn connect(config: &TransportConfig) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let addr = config.addr();
    debug!(%addr, "connecting");

    let stream = match tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
        Err(_) => {
            return Err(TransportError::Connect {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };
    stream.set_nodelay(true)?;

    let (reader, mut writer) = stream.into_split();
    let negotiation = baud_negotiation(config.baud_rate, config.announce_com_port);
    writer.write_all(&negotiation).await?;
    writer.flush().await?;
    debug!(baud = config.baud_rate, "line speed negotiated");

    Ok((reader, writer))
}

async fn pump(
    mut reader: OwnedReadHalf,
    data: &mpsc::UnboundedSender<Bytes>,
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        buf.reserve(READ_CHUNK_SIZE);
        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        trace!(len = read, "received chunk");
        // A dropped receiver is not a link failure; keep the socket drained.
        let _ = data.send(buf.split().freeze());
    }
}

fn set_state(state: &watch::Sender<bool>, connected: bool) {
    state.send_if_modified(|current| {
        if *current == connected {
            false
        } else {
            *current = connected;
            true
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
