use std::fmt;

use crate::message::LogEntry;

/// Which side of a version mismatch the peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRelation {
    Older,
    Newer,
}

impl fmt::Display for VersionRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Older => f.write_str("peer is older"),
            Self::Newer => f.write_str("peer is newer"),
        }
    }
}

/// Errors that can occur on a connection.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] modlink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] modlink_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A named value is unregistered or fails its schema.
    #[error("payload type error: {0}")]
    Schema(#[from] modlink_schema::SchemaError),

    /// The peer sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer speaks a different protocol version.
    #[error("protocol violation: {relation} (local {local}, peer {peer})")]
    VersionMismatch {
        local: u32,
        peer: u32,
        relation: VersionRelation,
    },

    /// The stream is gone.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// JSON has no encoding for NaN or infinity.
    #[error("non-finite float cannot be encoded: {0}")]
    NonFiniteFloat(f64),
}

impl PeerError {
    /// Handshake-class failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::VersionMismatch { .. }
        )
    }

    /// True for a clean end of stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Self::Frame(modlink_frame::FrameError::ConnectionClosed) | Self::Disconnected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Errors returned by [`ModuleHost`](crate::host::ModuleHost) calls.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The OS randomness source failed while drawing a correlation id.
    #[error("failed to generate correlation id: {0}")]
    FailedToGenId(#[source] rand::Error),

    /// The request could not be written.
    #[error("failed to send {command}: {source}")]
    Send {
        command: String,
        #[source]
        source: PeerError,
    },

    /// The module answered with data of the wrong shape.
    #[error("return datatype is incorrect: expected {expected}, got {found}")]
    InvalidResponse {
        expected: &'static str,
        found: &'static str,
    },

    /// The module reported a failure for this call.
    #[error("module reported failure: {}", join_entries(.entries))]
    Remote { entries: Vec<LogEntry> },

    /// The connection to the module is gone.
    #[error("module connection closed")]
    Closed,

    /// The version handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] PeerError),

    /// Launching or supervising the module process failed.
    #[error(transparent)]
    Transport(#[from] modlink_transport::TransportError),

    /// A blocking host call panicked or was cancelled.
    #[cfg(feature = "async")]
    #[error("host task failed: {0}")]
    Task(String),
}

impl HostError {
    /// The remote log entries behind a `Remote` error.
    pub fn entries(&self) -> &[LogEntry] {
        match self {
            Self::Remote { entries } => entries,
            _ => &[],
        }
    }
}

fn join_entries(entries: &[LogEntry]) -> String {
    entries
        .iter()
        .map(|entry| entry.text.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur on relay files.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay file content error: {0}")]
    Codec(#[from] PeerError),

    /// The file was closed or cleaned up.
    #[error("relay file {0} is closed")]
    Closed(String),
}
