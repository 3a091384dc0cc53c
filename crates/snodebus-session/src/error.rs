use std::fmt;

/// Why the bus master refused or failed to deliver a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The target id is busy with another transfer.
    Busy,
    /// The node did not acknowledge the message.
    NoAck,
    /// No matching reply arrived within the per-attempt timeout.
    Timeout,
    /// The payload size was rejected.
    InvalidSize,
    /// The id is unknown to the bus master.
    InvalidId,
}

impl FailureReason {
    /// True for failures that may succeed when the packet is sent again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Busy | Self::NoAck | Self::Timeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Busy => "id busy",
            Self::NoAck => "no acknowledgement from node",
            Self::Timeout => "no response",
            Self::InvalidSize => "invalid packet size",
            Self::InvalidId => "invalid id",
        };
        f.write_str(text)
    }
}

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Endpoint keys are exactly 16 bytes.
    #[error("invalid key length ({0} bytes, expected 16)")]
    InvalidKeyLength(usize),

    /// The message does not fit a Send-Message packet.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// No room left in the Init packet for another key.
    #[error("registry full ({0} endpoints)")]
    RegistryFull(usize),

    /// The endpoint was closed before the send was issued.
    #[error("sending on a closed endpoint")]
    EndpointClosed,

    /// The endpoint has no id yet because no handshake covered it.
    #[error("endpoint has no assigned id")]
    Unassigned,

    /// A handshake renumbered the endpoint while the send was queued.
    #[error("id {expected} is stale (endpoint now has {current:?})")]
    StaleId { expected: u8, current: Option<u8> },

    /// The bus master rejected the packet with a non-retryable reply.
    #[error("rejected: {0}")]
    Rejected(FailureReason),

    /// Every attempt failed with a retryable reason.
    #[error("gave up after {attempts} attempts: {reason}")]
    RetriesExhausted {
        attempts: usize,
        reason: FailureReason,
    },

    /// Frame-level error, including transport write failures.
    #[error("frame error: {0}")]
    Frame(#[from] snodebus_frame::FrameError),

    /// The session (or the packet stream under it) has shut down.
    #[error("session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
