use std::fmt;
use std::io;

use snodebus::frame::FrameError;
use snodebus::session::{FailureReason, SessionError};
use snodebus::transport::TransportError;
use snodebus::BridgeError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        TransportError::Shutdown => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Transport(err) => transport_error(context, err),
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Frame(err) => frame_error(context, err),
        SessionError::InvalidKeyLength(_) | SessionError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SessionError::RegistryFull(_) => CliError::new(USAGE, format!("{context}: {err}")),
        SessionError::Rejected(FailureReason::InvalidSize) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SessionError::RetriesExhausted {
            reason: FailureReason::Timeout,
            ..
        } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn bridge_error(context: &str, err: BridgeError) -> CliError {
    match err {
        BridgeError::Transport(err) => transport_error(context, err),
        BridgeError::Session(err) => session_error(context, err),
        BridgeError::Io(source) => io_error(context, source),
        BridgeError::InvalidConfig(_) | BridgeError::InvalidKey { .. } | BridgeError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        BridgeError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        BridgeError::Closed => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}
