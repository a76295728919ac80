//! Error types for the driver crate.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use vmctl_core::CoreError;

/// Errors that can occur during emulator lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The instance configuration is not usable by this driver.
    #[error(transparent)]
    Config(#[from] CoreError),

    /// The emulator command line could not be built.
    #[error("building emulator command line: {0}")]
    Cmdline(String),

    /// A launch argument contains a malformed template directive.
    #[error("invalid template in argument {arg:?}: {reason}")]
    Template { arg: String, reason: String },

    /// A template directive could not connect to its socket.
    #[error("fd_connect: {}: {source}", path.display())]
    FdConnect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The emulator process could not be started.
    #[error("emulator spawn failed: {0}")]
    SpawnFailed(String),

    /// The emulator exited with an error.
    #[error("emulator exited: {0}")]
    Process(ExitError),

    /// A socket file did not appear in time.
    #[error("timeout waiting for {} after {waited:?}", path.display())]
    SocketTimeout { path: PathBuf, waited: Duration },

    /// The control socket refused or timed out the connection.
    #[error("connect to QMP socket {}: {source}", path.display())]
    QmpConnect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The control protocol exchange broke down.
    #[error("QMP protocol error: {0}")]
    Qmp(String),

    /// The emulator rejected a control command.
    #[error("QMP command {command} failed: {class}: {desc}")]
    QmpCommand {
        command: String,
        class: String,
        desc: String,
    },

    /// Start was called while a process handle is still live.
    #[error("emulator already started")]
    AlreadyStarted,

    /// Stop was called without a live process handle.
    #[error("emulator not started")]
    NotStarted,

    /// The disk image backend failed.
    #[error("disk operation failed: {0}")]
    Disk(String),

    /// The snapshot backend failed.
    #[error("snapshot operation failed: {0}")]
    Snapshot(String),

    /// The network forwarding bridge failed.
    #[error("network bridge: {0}")]
    Bridge(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure half of the value delivered on an exit signal.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ExitError {
    /// The process exited non-zero or was killed by a signal.
    Status(ExitStatus),
    /// Waiting on the process failed.
    Wait(String),
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "{status}"),
            Self::Wait(reason) => write!(f, "wait failed: {reason}"),
        }
    }
}

impl std::error::Error for ExitError {}

impl From<ExitError> for DriverError {
    fn from(e: ExitError) -> Self {
        Self::Process(e)
    }
}
