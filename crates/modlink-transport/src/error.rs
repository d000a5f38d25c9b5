use std::path::PathBuf;

/// Errors that can occur while launching or supervising a module.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The module executable could not be started.
    #[error("failed to spawn module {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    /// A stdio handle was already taken or never piped.
    #[error("module {0} is not piped")]
    MissingStdio(&'static str),

    /// Waiting on the module process failed.
    #[error("failed to wait for module pid {pid}: {source}")]
    Wait { pid: u32, source: std::io::Error },

    /// An I/O error occurred on a module stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
