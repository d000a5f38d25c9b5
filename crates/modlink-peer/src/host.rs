use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use modlink_frame::FrameConfig;
use modlink_schema::TypeRegistry;
use modlink_transport::ModuleProcess;
use tracing::{debug, error, info, warn};

use crate::codec::PayloadCodec;
use crate::connection::Connection;
use crate::error::HostError;
use crate::handshake::{handshake_host, HandshakeConfig};
use crate::message::{
    methods_from_value, CorrelationId, LogEntry, Methods, Payload, Response, Severity,
    GET_METHODS, KILL,
};
use crate::value::Value;

/// Configuration for [`ModuleHost`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Module name used in logs.
    pub name: String,
    pub frame: FrameConfig,
    pub handshake: HandshakeConfig,
    pub registry: Arc<TypeRegistry>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "module".to_string(),
            frame: FrameConfig::default(),
            handshake: HandshakeConfig::default(),
            registry: Arc::new(TypeRegistry::builtin()),
        }
    }
}

impl HostConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Outstanding calls keyed by correlation id.
#[derive(Default)]
struct PendingCalls {
    inner: RwLock<PendingState>,
}

#[derive(Default)]
struct PendingState {
    calls: HashMap<CorrelationId, SyncSender<Response>>,
    closed: bool,
}

impl PendingCalls {
    /// Register a fresh id; redraws on collision with an outstanding call.
    fn register(&self) -> Result<(CorrelationId, Receiver<Response>), HostError> {
        let (tx, rx) = sync_channel(1);
        let mut state = self.inner.write().map_err(|_| HostError::Closed)?;
        if state.closed {
            return Err(HostError::Closed);
        }
        loop {
            let id = CorrelationId::random().map_err(HostError::FailedToGenId)?;
            if !state.calls.contains_key(&id) {
                state.calls.insert(id, tx);
                return Ok((id, rx));
            }
        }
    }

    fn unregister(&self, id: &CorrelationId) {
        if let Ok(mut state) = self.inner.write() {
            state.calls.remove(id);
        }
    }

    fn deliver(&self, response: Response) {
        let slot = match self.inner.read() {
            Ok(state) => state.calls.get(&response.id).cloned(),
            Err(_) => None,
        };
        let Some(slot) = slot else {
            debug!(id = %response.id, "dropping response for unknown id");
            return;
        };
        match slot.try_send(response) {
            Ok(()) => {}
            Err(TrySendError::Full(response)) => {
                warn!(id = %response.id, "dropping duplicate response");
            }
            // Caller gave up; late responses are dropped.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Fail every outstanding call and refuse new ones.
    fn close(&self, reason: &str) {
        let drained: Vec<_> = match self.inner.write() {
            Ok(mut state) => {
                state.closed = true;
                state.calls.drain().collect()
            }
            Err(_) => return,
        };
        for (id, slot) in drained {
            let _ = slot.try_send(Response::protocol_failure(id, reason));
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.read().map(|state| state.closed).unwrap_or(true)
    }

    fn outstanding(&self) -> usize {
        self.inner.read().map(|state| state.calls.len()).unwrap_or(0)
    }
}

/// Host side of one module connection.
///
/// Many threads may call [`ask_methods`](Self::ask_methods) and
/// [`execute_method`](Self::execute_method) at once; one background thread
/// reads responses and hands each to the caller waiting on its id.
pub struct ModuleHost {
    name: String,
    connection: Arc<Connection>,
    pending: Arc<PendingCalls>,
    peer_version: u32,
    killed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<ModuleProcess>>,
}

impl ModuleHost {
    /// Handshake over an existing stream pair, then start the reader thread.
    pub fn start(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        config: HostConfig,
    ) -> Result<Self, HostError> {
        let codec = PayloadCodec::new(Arc::clone(&config.registry));
        let connection = Arc::new(Connection::open_with_config(
            reader,
            writer,
            codec,
            config.frame.clone(),
        ));

        let peer_version =
            handshake_host(&connection, &config.handshake).map_err(HostError::Handshake)?;

        let pending = Arc::new(PendingCalls::default());
        let handle = spawn_reader(&config.name, Arc::clone(&connection), Arc::clone(&pending))?;

        info!(module = %config.name, version = peer_version, "module connected");
        Ok(Self {
            name: config.name,
            connection,
            pending,
            peer_version,
            killed: AtomicBool::new(false),
            reader: Mutex::new(Some(handle)),
            process: Mutex::new(None),
        })
    }

    /// Launch a module executable and start a host over its stdio.
    pub fn spawn<I, S>(program: impl AsRef<Path>, args: I, config: HostConfig) -> Result<Self, HostError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut process = ModuleProcess::spawn(program, args)?;
        let stdio = process.take_stdio()?;
        // On failure `process` drops here and the child is killed.
        let host = Self::start(stdio.reader, stdio.writer, config)?;
        if let Ok(mut slot) = host.process.lock() {
            *slot = Some(process);
        }
        Ok(host)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol version the module reported.
    pub fn peer_version(&self) -> u32 {
        self.peer_version
    }

    /// True once the response stream has failed.
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Number of calls waiting for a response.
    pub fn outstanding_calls(&self) -> usize {
        self.pending.outstanding()
    }

    /// Ask the module for its capability table.
    pub fn ask_methods(&self) -> Result<Methods, HostError> {
        let response = self.call(GET_METHODS, Payload::GetMethods)?;
        methods_from_value(&response.data).ok_or(HostError::InvalidResponse {
            expected: "methods",
            found: response.data.kind(),
        })
    }

    /// Run `function` (`"<category>_<identifier>"`) with `args`.
    pub fn execute_method(&self, function: &str, args: Vec<Value>) -> Result<Value, HostError> {
        let response = self.call(function, Payload::Execute { args })?;
        Ok(response.data)
    }

    /// Ask the module to stop its dispatch loop. No response is awaited.
    pub fn kill(&self) -> Result<(), HostError> {
        self.killed.store(true, Ordering::SeqCst);
        let id = CorrelationId::random().unwrap_or(CorrelationId::ZERO);
        self.connection
            .send(KILL, Payload::Kill, id)
            .map_err(|source| HostError::Send {
                command: KILL.to_string(),
                source,
            })
    }

    /// Kill the module and, for spawned modules, wait up to `timeout` for
    /// the process to exit before killing it forcibly.
    pub fn shutdown(&self, timeout: Duration) -> Result<Option<ExitStatus>, HostError> {
        if let Err(err) = self.kill() {
            debug!(module = %self.name, error = %err, "kill not delivered");
        }

        let process = self.process.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut process) = process else {
            return Ok(None);
        };
        let status = process.shutdown(timeout)?;
        info!(module = %self.name, ?status, "module exited");

        // The child's stdout is closed now, so the reader thread is ending.
        let handle = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(Some(status))
    }

    fn call(&self, command: &str, payload: Payload) -> Result<Response, HostError> {
        let (id, slot) = self.pending.register()?;

        if let Err(source) = self.connection.send(command, payload, id) {
            self.pending.unregister(&id);
            return Err(HostError::Send {
                command: command.to_string(),
                source,
            });
        }

        let response = slot.recv();
        self.pending.unregister(&id);
        let response = response.map_err(|_| HostError::Closed)?;

        forward_log(&self.name, command, &response.log);
        let failures: Vec<LogEntry> = response.failures().cloned().collect();
        if !failures.is_empty() {
            return Err(HostError::Remote { entries: failures });
        }
        Ok(response)
    }
}

impl Drop for ModuleHost {
    fn drop(&mut self) {
        // Let an in-process module leave its loop so the reader thread ends.
        if !self.killed.load(Ordering::SeqCst) && !self.is_closed() {
            let _ = self.kill();
        }
    }
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("name", &self.name)
            .field("peer_version", &self.peer_version)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn spawn_reader(
    name: &str,
    connection: Arc<Connection>,
    pending: Arc<PendingCalls>,
) -> Result<JoinHandle<()>, HostError> {
    let module = name.to_string();
    std::thread::Builder::new()
        .name(format!("modlink-reader-{name}"))
        .spawn(move || loop {
            match connection.try_get_response() {
                Ok(response) => pending.deliver(response),
                Err(err) => {
                    if err.is_end_of_stream() {
                        debug!(%module, "module closed its output");
                    } else {
                        error!(%module, error = %err, "module response stream failed");
                    }
                    pending.close(&err.to_string());
                    return;
                }
            }
        })
        .map_err(|err| HostError::Transport(err.into()))
}

/// Re-emit module log entries through `tracing`.
fn forward_log(module: &str, command: &str, entries: &[LogEntry]) {
    for entry in entries {
        let text = entry.text.as_str();
        match entry.severity {
            Severity::Debug => debug!(%module, %command, "{text}"),
            Severity::Info => info!(%module, %command, "{text}"),
            Severity::Error => warn!(%module, %command, "{text}"),
            Severity::InvalidResponse => error!(%module, %command, "{text}"),
            Severity::Fatal | Severity::ProtocolFailure => {
                error!(%module, %command, fatal = true, "{text}")
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;
    use crate::error::PeerError;
    use crate::handshake::handshake_module;
    use crate::message::{methods_to_value, Category};

    /// Minimal module loop speaking the protocol directly.
    fn fake_module(stream: UnixStream, version: u32) -> thread::JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let connection = Connection::open(stream.try_clone().unwrap(), stream);
            let mut seen = Vec::new();
            if handshake_module(
                &connection,
                &HandshakeConfig {
                    protocol_version: version,
                },
            )
            .is_err()
            {
                // Record whatever arrives after a failed handshake.
                let token = connection.receive();
                if !token.is_end_of_stream() {
                    seen.push(token.command.clone());
                }
                return seen;
            }

            loop {
                let token = connection.receive();
                if token.is_end_of_stream() {
                    return seen;
                }
                seen.push(token.command.clone());
                match token.command.as_str() {
                    KILL => return seen,
                    GET_METHODS => {
                        let mut methods = Methods::new();
                        methods.insert(
                            Category::TemplateFunctions.key().to_string(),
                            vec!["echo".to_string()],
                        );
                        let data = methods_to_value(&methods);
                        token.respond(&data, &[]).unwrap();
                    }
                    "templateFunctions_echo" => {
                        let data = token.data.first().cloned().unwrap_or_default();
                        token.respond(&data, &[]).unwrap();
                    }
                    "templateFunctions_fatal" => {
                        let log = [LogEntry::new(Severity::Fatal, "test error")];
                        token.respond(&Value::Null, &log).unwrap();
                    }
                    "templateFunctions_stray" => {
                        // A response nobody asked for, then the real one.
                        connection
                            .respond(CorrelationId([42; 10]), &Value::from("stray"), &[])
                            .unwrap();
                        token.respond(&Value::from("real"), &[]).unwrap();
                    }
                    "templateFunctions_hangup" => return seen,
                    _ => {
                        let log = [LogEntry::fault(crate::message::Fault::InvalidCommand, None)];
                        token.respond(&Value::Null, &log).unwrap();
                    }
                }
            }
        })
    }

    fn start_pair(module_version: u32) -> (Result<ModuleHost, HostError>, thread::JoinHandle<Vec<String>>) {
        let (host_end, module_end) = UnixStream::pair().unwrap();
        let module = fake_module(module_end, module_version);
        let host = ModuleHost::start(
            host_end.try_clone().unwrap(),
            host_end,
            HostConfig::named("fake"),
        );
        (host, module)
    }

    #[test]
    fn ask_methods_and_execute() {
        let (host, module) = start_pair(1);
        let host = host.unwrap();
        assert_eq!(host.peer_version(), 1);

        let methods = host.ask_methods().unwrap();
        assert_eq!(methods["templateFunctions"], vec!["echo".to_string()]);

        let result = host
            .execute_method("templateFunctions_echo", vec![Value::from("hi")])
            .unwrap();
        assert_eq!(result, Value::from("hi"));

        host.kill().unwrap();
        assert_eq!(
            module.join().unwrap(),
            vec![GET_METHODS, "templateFunctions_echo", KILL]
        );
    }

    #[test]
    fn thousands_of_concurrent_calls_stay_correlated() {
        let (host, module) = start_pair(1);
        let host = Arc::new(host.unwrap());

        let callers: Vec<_> = (0..16)
            .map(|t| {
                let host = Arc::clone(&host);
                thread::spawn(move || {
                    for i in 0..80 {
                        let arg = Value::from(format!("{t}:{i}"));
                        let result = host
                            .execute_method("templateFunctions_echo", vec![arg.clone()])
                            .unwrap();
                        assert_eq!(result, arg);
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        assert_eq!(host.outstanding_calls(), 0);
        host.kill().unwrap();
        assert_eq!(module.join().unwrap().len(), 16 * 80 + 1);
    }

    #[test]
    fn fatal_entry_becomes_remote_error() {
        let (host, _module) = start_pair(1);
        let host = host.unwrap();

        let err = host
            .execute_method("templateFunctions_fatal", Vec::new())
            .unwrap_err();
        assert!(matches!(&err, HostError::Remote { .. }));
        assert_eq!(err.entries()[0].text, "test error");
        assert_eq!(err.entries()[0].severity, Severity::Fatal);
    }

    #[test]
    fn unknown_command_is_remote_error() {
        let (host, _module) = start_pair(1);
        let err = host
            .unwrap()
            .execute_method("dataLoaders_doesNotExist", Vec::new())
            .unwrap_err();
        assert_eq!(
            err.entries()[0].fault,
            Some(crate::message::Fault::InvalidCommand)
        );
    }

    #[test]
    fn stray_response_is_dropped() {
        let (host, _module) = start_pair(1);
        let host = host.unwrap();
        let result = host
            .execute_method("templateFunctions_stray", Vec::new())
            .unwrap();
        assert_eq!(result, Value::from("real"));
    }

    #[test]
    fn methods_of_wrong_shape_is_invalid_response() {
        let (host_end, module_end) = UnixStream::pair().unwrap();
        // Answer getMethods with a non-table.
        let module = thread::spawn(move || {
            let connection = Connection::open(module_end.try_clone().unwrap(), module_end);
            handshake_module(&connection, &HandshakeConfig::default()).unwrap();
            let token = connection.receive();
            token.respond(&Value::Int(1), &[]).unwrap();
        });
        let host = ModuleHost::start(host_end.try_clone().unwrap(), host_end, HostConfig::default())
            .unwrap();

        let err = host.ask_methods().unwrap_err();
        module.join().unwrap();
        assert!(matches!(
            err,
            HostError::InvalidResponse {
                expected: "methods",
                found: "int"
            }
        ));
    }

    #[test]
    fn dead_stream_fails_pending_and_later_calls() {
        let (host, module) = start_pair(1);
        let host = host.unwrap();

        let err = host
            .execute_method("templateFunctions_hangup", Vec::new())
            .unwrap_err();
        assert_eq!(err.entries()[0].severity, Severity::ProtocolFailure);
        module.join().unwrap();

        // The reader thread marks the host closed once it sees EOF.
        while !host.is_closed() {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            host.execute_method("templateFunctions_echo", Vec::new()),
            Err(HostError::Closed)
        ));
    }

    #[test]
    fn version_mismatch_stops_before_application_traffic() {
        for module_version in [0, 2] {
            let (host, module) = start_pair(module_version);
            let err = host.unwrap_err();
            assert!(
                matches!(&err, HostError::Handshake(inner) if inner.is_protocol_violation()),
                "unexpected error: {err}"
            );
            assert!(module.join().unwrap().is_empty());
        }
    }

    #[test]
    fn handshake_on_closed_stream_fails() {
        let (host_end, module_end) = UnixStream::pair().unwrap();
        drop(module_end);
        let err = ModuleHost::start(host_end.try_clone().unwrap(), host_end, HostConfig::default())
            .unwrap_err();
        assert!(matches!(err, HostError::Handshake(PeerError::Frame(_))));
    }
}
