//! Tokio front end for [`ModuleHost`].
//!
//! Each call runs the blocking host operation on the blocking pool, so many
//! calls may be awaited concurrently from one task.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HostError;
use crate::host::{HostConfig, ModuleHost};
use crate::message::Methods;
use crate::value::Value;

/// Cloneable async handle to one module.
#[derive(Debug, Clone)]
pub struct AsyncModuleHost {
    inner: Arc<ModuleHost>,
}

impl AsyncModuleHost {
    pub fn new(host: ModuleHost) -> Self {
        Self {
            inner: Arc::new(host),
        }
    }

    /// Launch `program` and complete the handshake off the runtime threads.
    pub async fn spawn<I, S>(
        program: impl Into<PathBuf>,
        args: I,
        config: HostConfig,
    ) -> Result<Self, HostError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.into();
        let args: Vec<std::ffi::OsString> =
            args.into_iter().map(|arg| arg.as_ref().to_owned()).collect();
        let host = tokio::task::spawn_blocking(move || ModuleHost::spawn(program, args, config))
            .await
            .map_err(|err| HostError::Task(err.to_string()))??;
        Ok(Self::new(host))
    }

    /// The blocking host underneath.
    pub fn blocking(&self) -> &ModuleHost {
        &self.inner
    }

    pub async fn ask_methods(&self) -> Result<Methods, HostError> {
        self.run(|host| host.ask_methods()).await
    }

    pub async fn execute_method(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value, HostError> {
        let function = function.into();
        self.run(move |host| host.execute_method(&function, args))
            .await
    }

    pub async fn kill(&self) -> Result<(), HostError> {
        self.run(|host| host.kill()).await
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<Option<ExitStatus>, HostError> {
        self.run(move |host| host.shutdown(timeout)).await
    }

    async fn run<T, F>(&self, call: F) -> Result<T, HostError>
    where
        T: Send + 'static,
        F: FnOnce(&ModuleHost) -> Result<T, HostError> + Send + 'static,
    {
        let host = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || call(&host))
            .await
            .map_err(|err| HostError::Task(err.to_string()))?
    }
}

impl From<ModuleHost> for AsyncModuleHost {
    fn from(host: ModuleHost) -> Self {
        Self::new(host)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;
    use crate::connection::Connection;
    use crate::handshake::{handshake_module, HandshakeConfig};
    use crate::message::{methods_to_value, GET_METHODS, KILL};

    fn echo_module(stream: UnixStream) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let connection = Connection::open(stream.try_clone().unwrap(), stream);
            handshake_module(&connection, &HandshakeConfig::default()).unwrap();
            loop {
                let token = connection.receive();
                if token.is_end_of_stream() || token.command == KILL {
                    return;
                }
                if token.command == GET_METHODS {
                    let mut methods = Methods::new();
                    methods.insert("templateFunctions".to_string(), vec!["echo".to_string()]);
                    let reply = methods_to_value(&methods);
                    token.respond(&reply, &[]).unwrap();
                    continue;
                }
                let reply = token.data.first().cloned().unwrap_or_default();
                token.respond(&reply, &[]).unwrap();
            }
        })
    }

    fn start() -> (AsyncModuleHost, thread::JoinHandle<()>) {
        let (host_end, module_end) = UnixStream::pair().unwrap();
        let module = echo_module(module_end);
        let host = ModuleHost::start(
            host_end.try_clone().unwrap(),
            host_end,
            HostConfig::named("echo"),
        )
        .unwrap();
        (AsyncModuleHost::new(host), module)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_calls_resolve_independently() {
        let (host, module) = start();

        let calls: Vec<_> = (0..32i64)
            .map(|i| {
                let host = host.clone();
                tokio::spawn(async move {
                    host.execute_method("templateFunctions_echo", vec![Value::Int(i)])
                        .await
                })
            })
            .collect();

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), Value::Int(i as i64));
        }

        let methods = host.ask_methods().await.unwrap();
        assert_eq!(methods["templateFunctions"], vec!["echo".to_string()]);

        host.kill().await.unwrap();
        module.join().unwrap();
    }

    #[tokio::test]
    async fn spawn_of_missing_program_fails() {
        let err = AsyncModuleHost::spawn(
            "/nonexistent/modlink-module",
            Vec::<&str>::new(),
            HostConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HostError::Transport(_)));
    }
}
