use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The protocol-facing stdio of a spawned module.
///
/// `reader` is the module's stdout, `writer` its stdin.
#[derive(Debug)]
pub struct ModuleStdio {
    pub reader: ChildStdout,
    pub writer: ChildStdin,
}

/// A module executable running as a child process.
///
/// stdin and stdout are piped for the protocol; stderr is inherited so module
/// diagnostics land on the host's stderr. The child is killed on drop if it is
/// still running.
#[derive(Debug)]
pub struct ModuleProcess {
    child: Child,
    program: PathBuf,
}

impl ModuleProcess {
    /// Launch `program` with `args`.
    pub fn spawn<I, S>(program: impl AsRef<Path>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.as_ref().to_path_buf();
        let child = Command::new(&program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: program.clone(),
                source,
            })?;

        info!(program = %program.display(), pid = child.id(), "spawned module process");
        Ok(Self { child, program })
    }

    /// Take the piped stdio handles. Succeeds once.
    pub fn take_stdio(&mut self) -> Result<ModuleStdio> {
        let reader = self
            .child
            .stdout
            .take()
            .ok_or(TransportError::MissingStdio("stdout"))?;
        let writer = self
            .child
            .stdin
            .take()
            .ok_or(TransportError::MissingStdio("stdin"))?;
        Ok(ModuleStdio { reader, writer })
    }

    /// OS process id.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Path the module was launched from.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let pid = self.child.id();
        self.child
            .try_wait()
            .map_err(|source| TransportError::Wait { pid, source })
    }

    /// Wait up to `timeout` for the module to exit on its own.
    ///
    /// Returns `Ok(None)` if it is still running when the timeout elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                debug!(pid = self.child.id(), ?status, "module process exited");
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Forcefully terminate the module and reap it.
    pub fn kill(&mut self) -> Result<ExitStatus> {
        let pid = self.child.id();
        match self.child.kill() {
            Ok(()) => debug!(pid, "killed module process"),
            // Already exited; fall through to reap.
            Err(err) if err.kind() == ErrorKind::InvalidInput => {}
            Err(source) => return Err(TransportError::Wait { pid, source }),
        }
        self.child
            .wait()
            .map_err(|source| TransportError::Wait { pid, source })
    }

    /// Give the module `grace` to exit, then kill it.
    pub fn shutdown(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.wait_timeout(grace)? {
            return Ok(status);
        }
        warn!(
            pid = self.child.id(),
            program = %self.program.display(),
            ?grace,
            "module did not exit in time; killing"
        );
        self.kill()
    }
}

impl Drop for ModuleProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            debug!(pid = self.child.id(), "module still running on drop; killing");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
