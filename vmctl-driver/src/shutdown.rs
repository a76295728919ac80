//! Graceful-then-forced emulator shutdown.
//!
//! The coordinator asks the guest to power down over QMP and waits for the
//! exit signal up to a deadline. Any failure on the graceful path (missing
//! socket, refused connection, rejected command, deadline) escalates to a
//! kill. Every path ends with the process reaped and the display artifacts
//! removed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vmctl_core::{filenames, VmType};

use crate::cleanup::{best_effort, remove_display_files, remove_pid_file};
use crate::exit::ProcessExit;
use crate::process::EmulatorProcess;
use crate::qmp::QmpSession;
use crate::usernet::PortForwarder;
use crate::DriverError;

/// Steps the coordinator moves through. Recorded in [`ShutdownReport::states`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ShutdownState {
    /// The emulator is live; nothing has been sent yet.
    Running,
    /// A power-down command was acknowledged.
    PowerdownRequested,
    /// Racing the exit signal against the deadline.
    WaitingForExit,
    /// The deadline elapsed before the emulator exited.
    TimedOut,
    /// A kill was delivered to the emulator.
    Killed,
    /// The exit outcome has been observed.
    Exited,
    /// Cleanup finished.
    Stopped,
}

/// How the emulator ended up dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ShutdownPath {
    /// Exited on its own after the power-down request.
    Graceful,
    /// Killed by the coordinator.
    Killed,
    /// Had already exited when the forced path was reached.
    AlreadyExited,
}

/// Result of a completed shutdown.
#[derive(Debug)]
pub struct ShutdownReport {
    /// Which path stopped the emulator.
    pub path: ShutdownPath,
    /// States visited, in order.
    pub states: Vec<ShutdownState>,
    /// The process outcome observed on the exit signal.
    pub exit: ProcessExit,
}

struct Unforward {
    forwarder: Arc<dyn PortForwarder>,
    port: u16,
    timeout: Duration,
}

pub(crate) struct ShutdownCoordinator {
    name: String,
    instance_dir: PathBuf,
    vm_type: VmType,
    shutdown_timeout: Duration,
    qmp_timeout: Duration,
    forward: Option<Unforward>,
    states: Vec<ShutdownState>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(
        name: String,
        instance_dir: PathBuf,
        vm_type: VmType,
        shutdown_timeout: Duration,
        qmp_timeout: Duration,
    ) -> Self {
        Self {
            name,
            instance_dir,
            vm_type,
            shutdown_timeout,
            qmp_timeout,
            forward: None,
            states: vec![ShutdownState::Running],
        }
    }

    /// Remove the SSH forward on `port` before powering down, giving the
    /// bridge at most `timeout`.
    pub(crate) fn with_unforward(
        mut self,
        forwarder: Arc<dyn PortForwarder>,
        port: u16,
        timeout: Duration,
    ) -> Self {
        self.forward = Some(Unforward {
            forwarder,
            port,
            timeout,
        });
        self
    }

    fn enter(&mut self, state: ShutdownState) {
        tracing::debug!(instance = %self.name, ?state, "shutdown state");
        self.states.push(state);
    }

    /// Stop `process`, gracefully if possible.
    ///
    /// Always returns with the emulator reaped.
    pub(crate) async fn run(mut self, process: &mut EmulatorProcess) -> ShutdownReport {
        // A bridge that cannot be reached must not prevent the power-down.
        if let Some(Unforward { forwarder, port, timeout }) = self.forward.take() {
            let res = tokio::time::timeout(timeout, forwarder.unforward(port))
                .await
                .unwrap_or_else(|_| {
                    Err(DriverError::Bridge(format!("unforward of port {port} timed out after {timeout:?}")))
                });
            best_effort("failed to remove SSH port forward", res);
        }

        let socket = self.instance_dir.join(filenames::QMP_SOCK);
        let mut session = match QmpSession::connect(&socket, self.qmp_timeout).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    instance = %self.name,
                    error = %e,
                    "failed to open the QMP socket, forcibly killing QEMU"
                );
                return self.force(process).await;
            }
        };

        tracing::info!(instance = %self.name, "sending QMP system_powerdown command");
        let sent = session.system_powerdown().await;
        session.disconnect().await;
        if let Err(e) = sent {
            tracing::warn!(
                instance = %self.name,
                error = %e,
                "failed to send system_powerdown, forcibly killing QEMU"
            );
            return self.force(process).await;
        }
        self.enter(ShutdownState::PowerdownRequested);

        self.enter(ShutdownState::WaitingForExit);
        let exit_signal = process.exit_signal();
        let exited = tokio::select! {
            exit = exit_signal.observe() => Some(exit),
            () = tokio::time::sleep(self.shutdown_timeout) => None,
        };

        if let Some(exit) = exited {
            self.enter(ShutdownState::Exited);
            match &exit {
                Ok(()) => tracing::info!(instance = %self.name, "QEMU has exited"),
                Err(e) => tracing::info!(instance = %self.name, error = %e, "QEMU has exited"),
            }
            remove_display_files(&self.instance_dir).await;
            self.enter(ShutdownState::Stopped);
            return ShutdownReport {
                path: ShutdownPath::Graceful,
                states: self.states,
                exit,
            };
        }

        self.enter(ShutdownState::TimedOut);
        tracing::warn!(
            instance = %self.name,
            timeout = ?self.shutdown_timeout,
            "QEMU did not exit in time, forcibly killing QEMU"
        );
        self.force(process).await
    }

    async fn force(mut self, process: &mut EmulatorProcess) -> ShutdownReport {
        let exit_signal = process.exit_signal();
        let (path, exit) = if process.request_kill() {
            self.enter(ShutdownState::Killed);
            // The waiter always records the reaped child, so this completes.
            let exit = exit_signal.observe().await;
            tracing::info!(instance = %self.name, "QEMU has exited, after killing forcibly");
            (ShutdownPath::Killed, exit)
        } else {
            tracing::info!(instance = %self.name, "QEMU has already exited");
            (ShutdownPath::AlreadyExited, exit_signal.observe().await)
        };
        self.enter(ShutdownState::Exited);

        remove_pid_file(&self.instance_dir, self.vm_type).await;
        remove_display_files(&self.instance_dir).await;
        self.enter(ShutdownState::Stopped);
        ShutdownReport {
            path,
            states: self.states,
            exit,
        }
    }
}
