use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use modlink_peer::{HostConfig, HostError, ModuleHost, PayloadCodec};
use modlink_schema::TypeRegistry;
use tracing::{debug, warn};

use crate::exit::{
    host_error, io_error, schema_error, CliError, CliResult, INTERNAL, TIMEOUT, USAGE,
};
use crate::output::OutputFormat;

pub mod check;
pub mod exec;
pub mod methods;
pub mod version;

/// Grace period for a module to exit after `KILL`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the capabilities a module registers.
    Methods(MethodsArgs),
    /// Execute one module command.
    Exec(ExecArgs),
    /// Configure a module and run its template-function self-tests.
    Check(CheckArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, types: Option<&Path>) -> CliResult<i32> {
    match command {
        Command::Methods(args) => methods::run(args, format, types),
        Command::Exec(args) => exec::run(args, format, types),
        Command::Check(args) => check::run(args, format, types),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug, Clone)]
pub struct ModuleArgs {
    /// Module executable.
    pub module: PathBuf,
    /// Time allowed for the handshake and for each call (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct MethodsArgs {
    #[command(flatten)]
    pub module: ModuleArgs,
    /// Arguments passed to the module executable.
    #[arg(last = true)]
    pub module_args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub module: ModuleArgs,
    /// Command to run, `<category>_<identifier>`.
    pub command: String,
    /// Call argument as JSON; repeatable.
    #[arg(long = "arg", value_name = "JSON")]
    pub args: Vec<String>,
    /// Seed a relay file with this JSON value and pass its path first.
    #[arg(long, value_name = "JSON", conflicts_with = "relay_file")]
    pub relay: Option<String>,
    /// Seed a relay file with this file's bytes and pass its path first.
    #[arg(long, value_name = "PATH", conflicts_with = "relay")]
    pub relay_file: Option<PathBuf>,
    /// Arguments passed to the module executable.
    #[arg(last = true)]
    pub module_args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub module: ModuleArgs,
    /// Configuration map sent with `internal_config`.
    #[arg(long, value_name = "JSON", default_value = "{}")]
    pub config: String,
    /// Arguments passed to the module executable.
    #[arg(last = true)]
    pub module_args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// A spawned module with a per-call deadline.
pub(crate) struct Session {
    host: Arc<ModuleHost>,
    registry: Arc<TypeRegistry>,
    timeout: Duration,
}

impl Session {
    pub(crate) fn open(
        args: &ModuleArgs,
        module_args: &[String],
        types: Option<&Path>,
    ) -> CliResult<Self> {
        let timeout = parse_duration(&args.timeout)?;
        let registry = Arc::new(load_registry(types)?);
        let config = HostConfig {
            name: module_name(&args.module),
            registry: Arc::clone(&registry),
            ..HostConfig::default()
        };

        let program = args.module.clone();
        let module_args = module_args.to_vec();
        let host = timed("handshake", timeout, move || {
            ModuleHost::spawn(program, module_args, config)
        })?
        .map_err(|err| host_error("failed to start module", err))?;
        debug!(module = %host.name(), version = host.peer_version(), "session open");

        Ok(Self {
            host: Arc::new(host),
            registry,
            timeout,
        })
    }

    pub(crate) fn name(&self) -> &str {
        self.host.name()
    }

    /// Codec over the same type registry the host uses.
    pub(crate) fn codec(&self) -> PayloadCodec {
        PayloadCodec::new(Arc::clone(&self.registry))
    }

    /// Run `call` against the module, giving up after the session timeout.
    pub(crate) fn call<T, F>(&self, what: &str, call: F) -> CliResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ModuleHost) -> Result<T, HostError> + Send + 'static,
    {
        let host = Arc::clone(&self.host);
        timed(what, self.timeout, move || call(&host))?
            .map_err(|err| host_error(&format!("{what} failed"), err))
    }

    /// Close the session and report `outcome`. A call error takes
    /// precedence over a shutdown error, which is then only logged.
    pub(crate) fn finish<T>(self, outcome: CliResult<T>) -> CliResult<T> {
        settle(outcome, self.close())
    }

    /// Send `KILL` and wait briefly for the process to exit.
    fn close(self) -> CliResult<()> {
        let status = self
            .host
            .shutdown(SHUTDOWN_GRACE)
            .map_err(|err| host_error("shutdown failed", err))?;
        debug!(?status, "module stopped");
        Ok(())
    }
}

fn settle<T>(outcome: CliResult<T>, closed: CliResult<()>) -> CliResult<T> {
    match (outcome, closed) {
        (Ok(value), closed) => closed.map(|()| value),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "module shutdown failed");
            Err(err)
        }
    }
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string())
}

fn load_registry(types: Option<&Path>) -> CliResult<TypeRegistry> {
    match types {
        Some(dir) => TypeRegistry::from_directory(dir)
            .map_err(|err| schema_error(&format!("failed loading types from {}", dir.display()), err)),
        None => Ok(TypeRegistry::builtin()),
    }
}

/// Run `work` on a helper thread and wait at most `timeout` for it.
///
/// A timed-out worker is left running; the caller is about to exit.
fn timed<T, F>(what: &str, timeout: Duration, work: F) -> CliResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("modlink-{what}"))
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|err| io_error(&format!("failed to start {what}"), err))?;

    rx.recv_timeout(timeout).map_err(|err| match err {
        RecvTimeoutError::Timeout => {
            CliError::new(TIMEOUT, format!("{what} timed out after {timeout:?}"))
        }
        RecvTimeoutError::Disconnected => CliError::new(INTERNAL, format!("{what} worker died")),
    })
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

/// Parse a JSON command-line value.
pub(crate) fn parse_json(flag: &str, input: &str) -> CliResult<modlink_peer::Value> {
    serde_json::from_str::<serde_json::Value>(input)
        .map(modlink_peer::Value::from_json)
        .map_err(|err| CliError::new(USAGE, format!("{flag} is not valid JSON: {err}")))
}
