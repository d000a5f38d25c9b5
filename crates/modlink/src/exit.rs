use std::fmt;
use std::io;

use modlink_frame::FrameError;
use modlink_peer::{HostError, PeerError, RelayError};
use modlink_schema::SchemaError;
use modlink_transport::TransportError;

// Exit codes follow sysexits-style conventions.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
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
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Spawn { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn peer_error(context: &str, err: PeerError) -> CliError {
    match err {
        PeerError::Transport(err) => transport_error(context, err),
        PeerError::Frame(err) => frame_error(context, err),
        PeerError::Schema(err) => schema_error(context, err),
        PeerError::Json(err) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        PeerError::NonFiniteFloat(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        PeerError::Disconnected(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        other if other.is_protocol_violation() => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {other}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn schema_error(context: &str, err: SchemaError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn host_error(context: &str, err: HostError) -> CliError {
    match err {
        HostError::Transport(err) => transport_error(context, err),
        HostError::Handshake(err) | HostError::Send { source: err, .. } => peer_error(context, err),
        HostError::InvalidResponse { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        HostError::Remote { .. } | HostError::Closed => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn relay_error(context: &str, err: RelayError) -> CliError {
    match err {
        RelayError::Io(source) => io_error(context, source),
        RelayError::Codec(err) => peer_error(context, err),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
