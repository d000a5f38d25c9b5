//! Length-prefixed framing for the modlink protocol.
//!
//! A module talks to its host over a plain byte stream (usually the child's
//! stdin/stdout). Every unit on that stream is a frame:
//! - a 2-byte magic number ("AB") for stream synchronization
//! - a 1-byte frame kind (message or response)
//! - one reserved byte, always zero
//! - a 4-byte big-endian payload length
//!
//! Readers never see partial frames; the payload itself is opaque here.

pub mod codec;
pub mod error;
pub mod kind;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use kind::FrameKind;
pub use reader::FrameReader;
pub use writer::FrameWriter;
