use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use tracing::trace;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with custom configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                trace!(kind = %frame.kind, len = frame.payload.len(), "read frame");
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read the next frame and require it to be of `expected` kind.
    ///
    /// A mismatched frame is consumed and reported as
    /// [`FrameError::UnexpectedKind`].
    pub fn read_kind(&mut self, expected: FrameKind) -> Result<Frame> {
        let frame = self.read_frame()?;
        if frame.kind != expected {
            return Err(FrameError::UnexpectedKind {
                expected,
                found: frame.kind,
            });
        }
        Ok(frame)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the underlying stream.
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

    use bytes::BufMut;

    use super::*;
    use crate::codec::{encode_frame, MAGIC};
    use crate::writer::FrameWriter;

    fn wire(frames: &[(FrameKind, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (kind, payload) in frames {
            encode_frame(*kind, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn reads_frames_in_order() {
        let bytes = wire(&[
            (FrameKind::Message, b"first"),
            (FrameKind::Response, b"second"),
        ]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let a = reader.read_frame().unwrap();
        let b = reader.read_frame().unwrap();
        assert_eq!((a.kind, a.payload.as_ref()), (FrameKind::Message, &b"first"[..]));
        assert_eq!((b.kind, b.payload.as_ref()), (FrameKind::Response, &b"second"[..]));
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn payload_larger_than_read_chunk() {
        let payload = vec![b'x'; READ_CHUNK_SIZE * 3 + 17];
        let bytes = wire(&[(FrameKind::Response, &payload)]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload.len(), payload.len());
    }

    #[test]
    fn trickling_stream_still_yields_whole_frame() {
        let bytes = wire(&[(FrameKind::Message, b"trickle")]);
        let mut reader = FrameReader::new(OneByteAtATime { bytes, pos: 0 });

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload.as_ref(), b"trickle");
    }

    #[test]
    fn eof_inside_payload_is_connection_closed() {
        let mut partial = BytesMut::new();
        partial.put_slice(&MAGIC);
        partial.put_u8(FrameKind::Message.as_u8());
        partial.put_u8(0);
        partial.put_u32(32);
        partial.put_slice(b"short");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn max_payload_is_enforced_on_read() {
        let bytes = wire(&[(FrameKind::Message, &[0u8; 64])]);
        let config = FrameConfig {
            max_payload_size: 32,
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes), config);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 64, max: 32 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn read_kind_consumes_mismatch_and_keeps_sync() {
        let bytes = wire(&[
            (FrameKind::Message, b"stray"),
            (FrameKind::Response, b"wanted"),
        ]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let err = reader.read_kind(FrameKind::Response).unwrap_err();
        assert!(matches!(
            err,
            FrameError::UnexpectedKind {
                expected: FrameKind::Response,
                found: FrameKind::Message
            }
        ));
        assert!(!err.is_fatal());

        let frame = reader.read_kind(FrameKind::Response).unwrap();
        assert_eq!(frame.payload.as_ref(), b"wanted");
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let bytes = wire(&[(FrameKind::Response, b"ok")]);
        let mut reader = FrameReader::new(InterruptOnce {
            interrupted: false,
            inner: Cursor::new(bytes),
        });

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn other_io_errors_propagate() {
        let mut reader = FrameReader::new(BrokenPipe);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::BrokenPipe));
    }

    #[test]
    #[cfg(unix)]
    fn writer_to_reader_across_threads() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let consumer = std::thread::spawn(move || {
            (0..100)
                .map(|_| reader.read_kind(FrameKind::Message).unwrap().payload)
                .collect::<Vec<_>>()
        });

        for i in 0..100 {
            writer
                .send(FrameKind::Message, format!("call-{i}").as_bytes())
                .unwrap();
        }

        let received = consumer.join().unwrap();
        for (i, payload) in received.iter().enumerate() {
            assert_eq!(payload.as_ref(), format!("call-{i}").as_bytes());
        }
    }

    struct OneByteAtATime {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for OneByteAtATime {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptOnce {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptOnce {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(ErrorKind::Interrupted.into());
            }
            self.inner.read(buf)
        }
    }

    struct BrokenPipe;

    impl Read for BrokenPipe {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(ErrorKind::BrokenPipe.into())
        }
    }
}
