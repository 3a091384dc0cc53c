//! Bus master emulator for tests and bench work.
//!
//! Speaks the device side of the link over plain TCP: it swallows the
//! telnet negotiation, acknowledges Init, answers every Send-Message with
//! a configurable reply and can push node messages to the host.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use snodebus_frame::{encode_frame, FrameCodec, FrameError};
use snodebus_session::opcode::{
    self, INIT, INIT_ACK, KEY_LEN, MESSAGE_RECEIVED, MESSAGE_SENT_ACK, SEND_MESSAGE,
};
use snodebus_session::FailureReason;
use snodebus_transport::telnet::{COM_PORT_OPTION, IAC, SB, SE, SET_BAUDRATE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

const EVENT_BUFFER: usize = 256;
const READ_CHUNK_SIZE: usize = 1024;

/// How the emulator answers Send-Message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimReply {
    /// `0x94 id`.
    #[default]
    Ack,
    /// Reply with the opcode for this failure.
    Fail(FailureReason),
}

impl SimReply {
    fn opcode(self) -> u8 {
        match self {
            Self::Ack => MESSAGE_SENT_ACK,
            Self::Fail(reason) => opcode::failure_opcode(reason).unwrap_or(MESSAGE_SENT_ACK),
        }
    }
}

/// Emulator behaviour.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Reply to every Send-Message.
    pub reply: SimReply,
    /// After acknowledging, send the message back as `0x93 id payload`.
    pub echo: bool,
}

/// Something the emulator observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Connected(SocketAddr),
    /// Line speed requested through COM-PORT-OPTION.
    BaudRate(u32),
    Init { keys: Vec<[u8; KEY_LEN]> },
    Message { id: u8, payload: Bytes },
    /// Any other decoded packet, such as a keep-alive.
    Other(Bytes),
    Disconnected(SocketAddr),
}

/// TCP server emulating the bus master behind a telnet server.
pub struct Simulator {
    local_addr: SocketAddr,
    events: broadcast::Sender<SimEvent>,
    outbound: broadcast::Sender<Bytes>,
    accept: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Simulator {
    /// Bind to `addr` and start accepting connections.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs, config: SimConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (outbound, _) = broadcast::channel(EVENT_BUFFER);
        let shutdown = CancellationToken::new();

        let span = tracing::info_span!("sim", addr = %local_addr);
        let handle = tokio::spawn(
            accept_loop(
                listener,
                Arc::new(config),
                events.clone(),
                outbound.clone(),
                shutdown.clone(),
            )
            .instrument(span),
        );
        info!(addr = %local_addr, "simulator listening");

        Ok(Self {
            local_addr,
            events,
            outbound,
            accept: Mutex::new(Some(handle)),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Observe connections and decoded packets.
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.events.subscribe()
    }

    /// Push `0x93 id payload` to every connected host.
    ///
    /// Returns the number of connections it was queued for.
    pub fn emit(&self, id: u8, payload: &[u8]) -> snodebus_frame::Result<usize> {
        let mut packet = Vec::with_capacity(payload.len() + 2);
        packet.push(MESSAGE_RECEIVED);
        packet.push(id);
        packet.extend_from_slice(payload);

        let mut frame = BytesMut::new();
        encode_frame(&packet, &mut frame)?;
        Ok(self.outbound.send(frame.freeze()).unwrap_or(0))
    }

    /// Stop accepting and drop every connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = lock(&self.accept).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<SimConfig>,
    events: broadcast::Sender<SimEvent>,
    outbound: broadcast::Sender<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        debug!(%peer, "host connected");
        let _ = events.send(SimEvent::Connected(peer));
        let conn = serve(
            stream,
            Arc::clone(&config),
            events.clone(),
            outbound.subscribe(),
            shutdown.clone(),
        );
        let events = events.clone();
        tokio::spawn(
            async move {
                if let Err(err) = conn.await {
                    debug!(error = %err, "connection ended with error");
                }
                let _ = events.send(SimEvent::Disconnected(peer));
            }
            .in_current_span(),
        );
    }
}

async fn serve(
    stream: TcpStream,
    config: Arc<SimConfig>,
    events: broadcast::Sender<SimEvent>,
    mut outbound: broadcast::Receiver<Bytes>,
    shutdown: CancellationToken,
) -> Result<(), FrameError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut telnet = TelnetFilter::default();
    let mut codec = FrameCodec::new();
    let mut plain = BytesMut::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = outbound.recv() => match frame {
                Ok(frame) => writer.write_all(&frame).await?,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(()),
            },
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                for baud in telnet.feed(&chunk[..n], &mut plain) {
                    debug!(baud, "line speed requested");
                    let _ = events.send(SimEvent::BaudRate(baud));
                }
                while let Some(packet) = codec.decode(&mut plain)? {
                    for reply in respond(&config, &packet, &events) {
                        let mut frame = BytesMut::new();
                        encode_frame(&reply, &mut frame)?;
                        writer.write_all(&frame).await?;
                    }
                }
            }
        }
    }
}

/// Record `packet` and build the replies the bus master would send.
fn respond(config: &SimConfig, packet: &[u8], events: &broadcast::Sender<SimEvent>) -> Vec<Vec<u8>> {
    match packet {
        [INIT, count, keys @ ..] if keys.len() == usize::from(*count) * KEY_LEN => {
            let keys = keys
                .chunks_exact(KEY_LEN)
                .filter_map(|key| key.try_into().ok())
                .collect::<Vec<[u8; KEY_LEN]>>();
            debug!(endpoints = keys.len(), "init");
            let _ = events.send(SimEvent::Init { keys });
            vec![vec![INIT_ACK]]
        }
        [SEND_MESSAGE, id, payload @ ..] => {
            trace!(id, len = payload.len(), "message");
            let _ = events.send(SimEvent::Message {
                id: *id,
                payload: Bytes::copy_from_slice(payload),
            });
            let mut replies = vec![vec![config.reply.opcode(), *id]];
            if config.echo && config.reply == SimReply::Ack {
                let mut echo = vec![MESSAGE_RECEIVED, *id];
                echo.extend_from_slice(payload);
                replies.push(echo);
            }
            replies
        }
        other => {
            trace!(len = other.len(), "ignoring packet");
            let _ = events.send(SimEvent::Other(Bytes::copy_from_slice(other)));
            Vec::new()
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    #[default]
    Data,
    Iac,
    Option,
    Sub,
    SubIac,
}

/// Strips telnet commands from the inbound stream.
#[derive(Debug, Default)]
struct TelnetFilter {
    state: TelnetState,
    sub: Vec<u8>,
}

impl TelnetFilter {
    /// Append the data bytes of `input` to `out`; returns any requested baud rates.
    fn feed(&mut self, input: &[u8], out: &mut BytesMut) -> Vec<u32> {
        let mut bauds = Vec::new();
        for &byte in input {
            self.state = match (self.state, byte) {
                (TelnetState::Data, IAC) => TelnetState::Iac,
                (TelnetState::Data, _) => {
                    out.extend_from_slice(&[byte]);
                    TelnetState::Data
                }
                (TelnetState::Iac, IAC) => {
                    out.extend_from_slice(&[IAC]);
                    TelnetState::Data
                }
                // WILL, WONT, DO, DONT carry one option byte.
                (TelnetState::Iac, 0xFB..=0xFE) => TelnetState::Option,
                (TelnetState::Iac, SB) => {
                    self.sub.clear();
                    TelnetState::Sub
                }
                (TelnetState::Iac, _) | (TelnetState::Option, _) => TelnetState::Data,
                (TelnetState::Sub, IAC) => TelnetState::SubIac,
                (TelnetState::Sub, _) => {
                    self.sub.push(byte);
                    TelnetState::Sub
                }
                (TelnetState::SubIac, IAC) => {
                    self.sub.push(IAC);
                    TelnetState::Sub
                }
                (TelnetState::SubIac, SE) => {
                    if let [COM_PORT_OPTION, SET_BAUDRATE, a, b, c, d] = self.sub[..] {
                        bauds.push(u32::from_be_bytes([a, b, c, d]));
                    }
                    TelnetState::Data
                }
                (TelnetState::SubIac, _) => TelnetState::Data,
            };
        }
        bauds
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
