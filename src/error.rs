use std::io;
use std::path::PathBuf;

/// The primary error type for all operations in the `rootvault` crate.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The privileged session could not be established at all (the shell program failed to
    /// spawn). A command that runs and exits nonzero is *not* this error.
    #[error("privileged shell unavailable while running `{command}`: {source}")]
    ShellCommandFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A specific privileged filesystem call returned a nonzero status or errno.
    #[error("{operation} failed on '{}' (intended {value}): {detail}", path.display())]
    PrivilegedOperationFailed {
        path: PathBuf,
        operation: &'static str,
        value: String,
        detail: String,
    },

    /// Materializing one archive entry failed; the restore stops here.
    /// `path` is relative to the restore root.
    #[error("unable to {operation} '{path}' to {value}: {source}")]
    UnpackFailed {
        path: String,
        operation: &'static str,
        value: String,
        #[source]
        source: Box<VaultError>,
    },

    /// The target is missing. Deletion and listing report this as `false` / empty instead of
    /// raising it.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// An I/O error, typically while copying a stream. Includes the path where it happened
    /// (empty when unknown).
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// The external document resolver refused an operation.
    #[error("document resolver error: {0}")]
    Document(String),

    /// Cancellation was requested between two archive entries.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VaultError {
    /// Attach a path to a bare I/O error.
    pub fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        VaultError::Io { source, path: path.into() }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            VaultError::NotFound { .. } => true,
            VaultError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<io::Error> for VaultError {
    fn from(err: io::Error) -> Self {
        VaultError::Io { source: err, path: PathBuf::new() }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
