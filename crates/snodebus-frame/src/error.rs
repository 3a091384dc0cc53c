/// Errors that can occur during frame encoding or delivery.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload does not fit the one-byte length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The underlying transport rejected the write.
    #[error("transport error: {0}")]
    Transport(#[from] snodebus_transport::TransportError),

    /// An I/O error surfaced through the codec.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
