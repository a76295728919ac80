//! Instance metadata as resolved by the instance store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::filenames;
use crate::VmType;

/// Running state reported by the instance store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[non_exhaustive]
pub enum InstanceStatus {
    /// The emulator process is alive.
    Running,
    /// No emulator process exists.
    Stopped,
    /// The store could not determine a consistent state.
    Broken,
}

/// A resolved VM instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Instance {
    /// Instance name.
    pub name: String,
    /// Directory holding all per-instance sockets, logs and pid files.
    pub dir: PathBuf,
    /// Last known running state.
    pub status: InstanceStatus,
}

impl Instance {
    /// Create instance metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, dir: PathBuf, status: InstanceStatus) -> Self {
        Self {
            name: name.into(),
            dir,
            status,
        }
    }

    /// Whether the store reports the instance as running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Path of the emulator control socket.
    #[must_use]
    pub fn qmp_socket(&self) -> PathBuf {
        self.dir.join(filenames::QMP_SOCK)
    }

    /// Path of the emulator pid marker.
    #[must_use]
    pub fn pid_file(&self, vm_type: VmType) -> PathBuf {
        self.dir.join(filenames::pid_file(vm_type))
    }
}
