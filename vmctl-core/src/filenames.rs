//! Well-known file names inside an instance directory.

use crate::VmType;

/// Emulator control (QMP) socket.
pub const QMP_SOCK: &str = "qmp.sock";

/// File holding the display service address.
pub const VNC_DISPLAY_FILE: &str = "vncdisplay";

/// File caching the display password.
pub const VNC_PASSWORD_FILE: &str = "vncpassword";

/// Guest serial console log.
pub const SERIAL_LOG: &str = "serial.log";

/// Pid marker written by the monitor of the given type, e.g. `qemu.pid`.
#[must_use]
pub fn pid_file(vm_type: VmType) -> String {
    format!("{vm_type}.pid")
}
