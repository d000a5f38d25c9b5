use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use tracing::trace;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// Each frame is written and flushed before `send` returns, so a frame is
/// never split across two callers when the writer sits behind a mutex.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with custom configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a pre-built frame.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.kind, frame.payload.as_ref())
    }

    /// Encode and send one frame.
    pub fn send(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(kind, payload, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        trace!(%kind, len = payload.len(), "wrote frame");
        self.flush()
    }

    /// Flush the underlying stream, retrying on interruption.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the underlying stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Frame limits in effect.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::decode_frame;
    use crate::reader::FrameReader;

    fn written(writer: FrameWriter<Cursor<Vec<u8>>>) -> BytesMut {
        BytesMut::from(writer.into_inner().into_inner().as_slice())
    }

    #[test]
    fn send_produces_decodable_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        writer.send(FrameKind::Response, b"result").unwrap();

        let mut wire = written(writer);
        let frame = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.payload.as_ref(), b"result");
    }

    #[test]
    fn write_frame_preserves_kind() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        writer
            .write_frame(&Frame::new(FrameKind::Message, "KILL"))
            .unwrap();

        let mut reader = FrameReader::new(Cursor::new(written(writer).to_vec()));
        let frame = reader.read_kind(FrameKind::Message).unwrap();
        assert_eq!(frame.payload.as_ref(), b"KILL");
    }

    #[test]
    fn oversized_payload_is_not_written() {
        let config = FrameConfig {
            max_payload_size: 8,
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), config);

        let err = writer.send(FrameKind::Message, b"nine bytes").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 10, max: 8 }));
        assert!(written(writer).is_empty());
    }

    #[test]
    fn transient_errors_are_retried() {
        let mut writer = FrameWriter::new(Flaky::default());
        writer.send(FrameKind::Message, b"retry").unwrap();

        let sink = writer.into_inner();
        assert_eq!(sink.data.len(), crate::HEADER_SIZE + 5);
        assert!(sink.flushed);
    }

    #[test]
    fn zero_length_write_means_closed() {
        let mut writer = FrameWriter::new(Closed);
        assert!(matches!(
            writer.send(FrameKind::Response, b"x"),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[derive(Default)]
    struct Flaky {
        writes: u8,
        flushes: u8,
        flushed: bool,
        data: Vec<u8>,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes += 1;
            match self.writes {
                1 => Err(ErrorKind::Interrupted.into()),
                2 => Err(ErrorKind::WouldBlock.into()),
                _ => {
                    // Short writes exercise the offset loop.
                    let n = buf.len().min(3);
                    self.data.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
            }
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            if self.flushes == 1 {
                return Err(ErrorKind::Interrupted.into());
            }
            self.flushed = true;
            Ok(())
        }
    }

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
