use std::future::Future;

/// An asynchronous sink that accepts whole buffers.
///
/// Implemented by [`TelnetTransport`](crate::TelnetTransport) at the byte
/// level and by the framer at the packet level, so the layers above can be
/// driven by either one (or by an in-memory double in tests).
pub trait ByteSink: Send + Sync {
    /// Error returned when a write fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Write `bytes` and resolve once the write has been handed to the OS.
    fn send(&self, bytes: &[u8]) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
