//! Best-effort side operations that never change an operation's outcome.

use std::fmt::Display;
use std::io;
use std::path::Path;

use vmctl_core::{filenames, VmType};

/// Log `res` at warning level if it failed, then forget it.
pub(crate) fn best_effort<E: Display>(what: &str, res: Result<(), E>) {
    if let Err(e) = res {
        tracing::warn!(error = %e, "{what}");
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove the display service file and cached display password.
pub(crate) async fn remove_display_files(instance_dir: &Path) {
    for name in [filenames::VNC_DISPLAY_FILE, filenames::VNC_PASSWORD_FILE] {
        let path = instance_dir.join(name);
        best_effort(
            &format!("failed to remove {}", path.display()),
            remove_if_exists(&path).await,
        );
    }
}

/// Remove the emulator pid marker.
pub(crate) async fn remove_pid_file(instance_dir: &Path, vm_type: VmType) {
    let path = instance_dir.join(filenames::pid_file(vm_type));
    best_effort(
        &format!("failed to remove {}", path.display()),
        remove_if_exists(&path).await,
    );
}
