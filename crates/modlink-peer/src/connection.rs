use std::fmt;
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};

use modlink_frame::{FrameConfig, FrameKind, FrameReader, FrameWriter};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::codec::{PayloadCodec, ResponseView};
use crate::error::{PeerError, Result};
use crate::message::{CorrelationId, LogEntry, Message, Payload, Response};
use crate::value::Value;

type BoxedReader = Box<dyn Read + Send>;
type BoxedWriter = Box<dyn Write + Send>;

/// A stream half whose framing is built on first use.
struct Deferred<S, F> {
    stream: Option<S>,
    framed: Option<F>,
}

impl<S, F> Deferred<S, F> {
    fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            framed: None,
        }
    }

    fn get_or_build(&mut self, build: impl FnOnce(S) -> F) -> Result<&mut F> {
        if self.framed.is_none() {
            let stream = self
                .stream
                .take()
                .ok_or_else(|| PeerError::Disconnected("stream half missing".to_string()))?;
            self.framed = Some(build(stream));
        }
        self.framed
            .as_mut()
            .ok_or_else(|| PeerError::Disconnected("stream half missing".to_string()))
    }
}

/// One duplex protocol stream.
///
/// Reads and writes are guarded by separate locks, so one thread may block
/// in [`get_response`](Self::get_response) while others send. Concurrent
/// sends are serialized frame by frame.
pub struct Connection {
    codec: PayloadCodec,
    frame_config: FrameConfig,
    reader: Mutex<Deferred<BoxedReader, FrameReader<BoxedReader>>>,
    writer: Mutex<Deferred<BoxedWriter, FrameWriter<BoxedWriter>>>,
}

impl Connection {
    /// Wrap a stream pair. No I/O happens until the first send or receive.
    pub fn open(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self::open_with_config(reader, writer, PayloadCodec::builtin(), FrameConfig::default())
    }

    pub fn open_with_config(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        codec: PayloadCodec,
        frame_config: FrameConfig,
    ) -> Self {
        Self {
            codec,
            frame_config,
            reader: Mutex::new(Deferred::new(Box::new(reader) as BoxedReader)),
            writer: Mutex::new(Deferred::new(Box::new(writer) as BoxedWriter)),
        }
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    /// Write one message frame.
    pub fn send(&self, command: &str, payload: Payload, id: CorrelationId) -> Result<()> {
        let message = Message {
            command: command.to_string(),
            payload,
            id,
        };
        let bytes = self.codec.encode_message(&message)?;
        self.write_frame(FrameKind::Message, &bytes)?;
        trace!(command, %id, "sent message");
        Ok(())
    }

    /// Write one response frame.
    pub fn respond(&self, id: CorrelationId, data: &Value, log: &[LogEntry]) -> Result<()> {
        let bytes = self.codec.encode_response(&ResponseFrame {
            id: &id,
            data,
            log,
        })?;
        self.write_frame(FrameKind::Response, &bytes)?;
        trace!(%id, entries = log.len(), "sent response");
        Ok(())
    }

    /// Read one message, surfacing any failure.
    pub fn try_receive(&self) -> Result<Message> {
        let frame = {
            let mut reader = self.lock_reader()?;
            let config = self.frame_config.clone();
            reader
                .get_or_build(|stream| FrameReader::with_config(stream, config))?
                .read_kind(FrameKind::Message)?
        };
        self.codec.decode_message(&frame.payload)
    }

    /// Read one message as a token.
    ///
    /// Any failure yields an end-of-stream token instead of an error.
    pub fn receive(&self) -> Token<'_> {
        match self.try_receive() {
            Ok(message) => Token {
                command: message.command,
                data: message.payload.into_args(),
                id: message.id,
                connection: self,
                end_of_stream: None,
            },
            Err(err) => {
                if err.is_end_of_stream() {
                    debug!("connection reached end of stream");
                } else {
                    warn!(error = %err, "failed to receive message; treating as end of stream");
                }
                Token {
                    command: String::new(),
                    data: Vec::new(),
                    id: CorrelationId::ZERO,
                    connection: self,
                    end_of_stream: Some(err),
                }
            }
        }
    }

    /// Read one response, surfacing any failure.
    pub fn try_get_response(&self) -> Result<Response> {
        let frame = {
            let mut reader = self.lock_reader()?;
            let config = self.frame_config.clone();
            reader
                .get_or_build(|stream| FrameReader::with_config(stream, config))?
                .read_kind(FrameKind::Response)?
        };
        self.codec.decode_response(&frame.payload)
    }

    /// Read one response.
    ///
    /// Any failure yields a response with the zero id whose log holds a single
    /// `ProtocolFailure` entry.
    pub fn get_response(&self) -> Response {
        self.try_get_response().unwrap_or_else(|err| {
            warn!(error = %err, "failed to read response");
            Response::protocol_failure(CorrelationId::ZERO, err.to_string())
        })
    }

    fn write_frame(&self, kind: FrameKind, bytes: &[u8]) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| PeerError::Disconnected("writer lock poisoned".to_string()))?;
        let config = self.frame_config.clone();
        writer
            .get_or_build(|stream| FrameWriter::with_config(stream, config))?
            .send(kind, bytes)?;
        Ok(())
    }

    fn lock_reader(
        &self,
    ) -> Result<MutexGuard<'_, Deferred<BoxedReader, FrameReader<BoxedReader>>>> {
        self.reader
            .lock()
            .map_err(|_| PeerError::Disconnected("reader lock poisoned".to_string()))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("codec", &self.codec)
            .field("frame_config", &self.frame_config)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ResponseFrame<'a> {
    id: &'a CorrelationId,
    data: &'a Value,
    log: &'a [LogEntry],
}

impl ResponseView for ResponseFrame<'_> {
    fn data(&self) -> &Value {
        self.data
    }
}

/// A received message, answerable exactly once.
pub struct Token<'c> {
    pub command: String,
    pub data: Vec<Value>,
    pub id: CorrelationId,
    connection: &'c Connection,
    end_of_stream: Option<PeerError>,
}

impl<'c> Token<'c> {
    /// True if this token stands for a failed read rather than a message.
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.is_some()
    }

    /// The read failure behind an end-of-stream token.
    pub fn error(&self) -> Option<&PeerError> {
        self.end_of_stream.as_ref()
    }

    /// Send the one response to this token.
    ///
    /// On failure the token is handed back so the caller can make a last
    /// attempt with different content.
    pub fn respond(self, data: &Value, log: &[LogEntry]) -> std::result::Result<(), Unanswered<'c>> {
        if self.end_of_stream.is_some() {
            return Err(Unanswered {
                error: PeerError::Disconnected("cannot respond to end of stream".to_string()),
                token: self,
            });
        }
        match self.connection.respond(self.id, data, log) {
            Ok(()) => Ok(()),
            Err(error) => Err(Unanswered { error, token: self }),
        }
    }
}

impl fmt::Debug for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("command", &self.command)
            .field("data", &self.data)
            .field("id", &self.id)
            .field("end_of_stream", &self.end_of_stream)
            .finish()
    }
}

/// A token whose response could not be sent.
#[derive(Debug)]
pub struct Unanswered<'c> {
    pub token: Token<'c>,
    pub error: PeerError,
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::message::{Severity, GET_METHODS, KILL};

    fn pair() -> (Connection, Connection) {
        let (left, right) = UnixStream::pair().unwrap();
        let host = Connection::open(left.try_clone().unwrap(), left);
        let module = Connection::open(right.try_clone().unwrap(), right);
        (host, module)
    }

    #[test]
    fn message_and_response_roundtrip() {
        let (host, module) = pair();
        let id = CorrelationId::random().unwrap();

        host.send(
            "templateFunctions_add",
            Payload::Execute {
                args: vec![Value::Int(2), Value::Int(3)],
            },
            id,
        )
        .unwrap();

        let token = module.receive();
        assert!(!token.is_end_of_stream());
        assert_eq!(token.command, "templateFunctions_add");
        assert_eq!(token.data, vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(token.id, id);

        let log = [LogEntry::new(Severity::Debug, "adding")];
        token.respond(&Value::Int(5), &log).unwrap();

        let response = host.get_response();
        assert_eq!(response.id, id);
        assert_eq!(response.data, Value::Int(5));
        assert_eq!(response.log, log.to_vec());
    }

    #[test]
    fn closed_stream_gives_end_of_stream_token() {
        let (host, module) = pair();
        drop(host);

        let token = module.receive();
        assert!(token.is_end_of_stream());
        assert!(token.error().unwrap().is_end_of_stream());
        let unanswered = token.respond(&Value::Null, &[]).unwrap_err();
        assert!(unanswered.token.is_end_of_stream());
    }

    #[test]
    fn garbage_gives_synthesized_failure_response() {
        let connection = Connection::open(Cursor::new(b"garbage!".to_vec()), Vec::new());
        let response = connection.get_response();

        assert_eq!(response.id, CorrelationId::ZERO);
        assert_eq!(response.data, Value::Null);
        assert_eq!(response.log.len(), 1);
        assert_eq!(response.log[0].severity, Severity::ProtocolFailure);
    }

    #[test]
    fn unregistered_response_data_is_not_sent() {
        let (host, module) = pair();
        host.send(GET_METHODS, Payload::GetMethods, CorrelationId([3; 10]))
            .unwrap();

        let token = module.receive();
        let bad = Value::typed("widget", Value::Null);
        let unanswered = token.respond(&bad, &[]).unwrap_err();
        assert!(matches!(unanswered.error, PeerError::Schema(_)));

        unanswered.token.respond(&Value::Null, &[]).unwrap();
        assert_eq!(host.get_response().id, CorrelationId([3; 10]));
    }

    #[test]
    fn concurrent_senders_do_not_interleave() {
        let (host, module) = pair();
        let host = Arc::new(host);

        let senders: Vec<_> = (0..8)
            .map(|t| {
                let host = Arc::clone(&host);
                thread::spawn(move || {
                    for i in 0..50 {
                        let text = format!("{t}-{i}-{}", "x".repeat(4096));
                        host.send(
                            KILL,
                            Payload::Execute {
                                args: vec![Value::from(text)],
                            },
                            CorrelationId::random().unwrap(),
                        )
                        .unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..400 {
            let token = module.receive();
            assert!(!token.is_end_of_stream());
            assert_eq!(token.command, KILL);
        }
        for sender in senders {
            sender.join().unwrap();
        }
    }

    #[test]
    fn open_performs_no_io() {
        let connection = Connection::open(FailingIo, FailingIo);
        drop(connection);
    }

    struct FailingIo;

    impl Read for FailingIo {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            panic!("read before first receive");
        }
    }

    impl Write for FailingIo {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            panic!("write before first send");
        }

        fn flush(&mut self) -> std::io::Result<()> {
            panic!("flush before first send");
        }
    }
}
