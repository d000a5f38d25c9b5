use crate::kind::FrameKind;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4142 \"AB\")")]
    InvalidMagic,

    /// The kind byte is not a known frame kind.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// A well-formed frame of the wrong kind arrived.
    #[error("unexpected {found} frame (expected {expected})")]
    UnexpectedKind {
        expected: FrameKind,
        found: FrameKind,
    },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True when the stream can no longer produce frames.
    ///
    /// A frame of the wrong kind is consumed whole, so the stream stays in
    /// sync after it. Everything else leaves the read position undefined.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnexpectedKind { .. })
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
