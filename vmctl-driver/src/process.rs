//! Emulator process supervision.
//!
//! [`start_emulator`] resolves the command line, expands argument templates,
//! launches the binary with the opened sockets inherited from descriptor 3
//! upwards, and leaves three kinds of background task behind: one line logger
//! per output pipe, a single exit waiter that owns the child, and optionally
//! an SSH forward registration.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use vmctl_core::{filenames, MacAddress};

use crate::exit::{exit_channel, ExitNotifier, ExitSignal, ProcessExit};
use crate::template::{ArgTemplater, FdConnector, FIRST_INHERITED_FD};
use crate::usernet::PortForwarder;
use crate::{DriverError, ExitError, LaunchConfig};

/// Builds the emulator binary path and raw (untemplated) arguments.
pub trait Cmdline: Send + Sync {
    /// Compute the command line for `cfg`.
    ///
    /// # Errors
    /// Returns [`DriverError::Cmdline`] if the configuration cannot be expressed.
    fn cmdline(&self, cfg: &LaunchConfig) -> Result<(PathBuf, Vec<String>), DriverError>;
}

impl<F> Cmdline for F
where
    F: Fn(&LaunchConfig) -> Result<(PathBuf, Vec<String>), DriverError> + Send + Sync,
{
    fn cmdline(&self, cfg: &LaunchConfig) -> Result<(PathBuf, Vec<String>), DriverError> {
        self(cfg)
    }
}

/// A running emulator.
///
/// The child itself is owned by the exit waiter task. Dropping this handle
/// does NOT terminate the emulator; stop it through the driver.
#[derive(Debug)]
pub struct EmulatorProcess {
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit: ExitSignal,
}

impl EmulatorProcess {
    /// OS process id, if the process had not already been reaped at spawn.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the process was started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// A handle on the process outcome.
    #[must_use]
    pub fn exit_signal(&self) -> ExitSignal {
        self.exit.clone()
    }

    /// Ask the exit waiter to SIGKILL the process.
    ///
    /// Returns `false` if the waiter has already observed the exit, in which
    /// case nothing is signalled.
    pub(crate) fn request_kill(&mut self) -> bool {
        self.kill_tx.take().is_some_and(|tx| tx.send(()).is_ok())
    }
}

/// Resolve, template and launch the emulator for `cfg`.
///
/// When `forwarder` is set, SSH forwarding is registered in the background
/// once the guest has a lease; its failure is only logged.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
/// Command-line, template, spawn and pipe errors are returned before any
/// background task is started.
pub fn start_emulator<C: FdConnector>(
    cmdline: &dyn Cmdline,
    mut templater: ArgTemplater<C>,
    cfg: &LaunchConfig,
    forwarder: Option<Arc<dyn PortForwarder>>,
) -> Result<EmulatorProcess, DriverError> {
    let (binary, raw_args) = cmdline.cmdline(cfg)?;
    let args = templater.apply_all(&raw_args)?;

    tracing::info!(
        instance = %cfg.name,
        "starting QEMU (hint: to watch the boot progress, see {:?})",
        cfg.instance_dir.join(filenames::SERIAL_LOG)
    );
    tracing::debug!(instance = %cfg.name, binary = %binary.display(), ?args, "emulator command line");

    let mut child = spawn(&binary, &args, templater.into_files())?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DriverError::SpawnFailed("stdout not piped".to_owned()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DriverError::SpawnFailed("stderr not piped".to_owned()))?;
    log_pipe(stdout, "stdout", cfg.name.clone());
    log_pipe(stderr, "stderr", cfg.name.clone());

    let started_at = Utc::now();
    let (notifier, exit) = exit_channel();
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(wait_for_exit(child, kill_rx, notifier, cfg.name.clone(), started_at));

    if let Some(forwarder) = forwarder {
        let mac = MacAddress::for_instance_dir(&cfg.instance_dir);
        let port = cfg.ssh_local_port;
        let name = cfg.name.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.forward(mac, port).await {
                tracing::warn!(instance = %name, %mac, port, error = %e, "failed to forward SSH port");
            }
        });
    }

    tracing::info!(instance = %cfg.name, ?pid, "QEMU started");
    Ok(EmulatorProcess {
        pid,
        started_at,
        kill_tx: Some(kill_tx),
        exit,
    })
}

/// Launch `binary` with `files` inherited as descriptors 3, 4, ...
fn spawn(binary: &Path, args: &[String], files: Vec<OwnedFd>) -> Result<Child, DriverError> {
    let inherited = relocate(&files)?;
    drop(files);
    let _reserved = match inherited.first() {
        Some(fd) => reserve_target_range(fd, FIRST_INHERITED_FD + inherited.len())?,
        None => Vec::new(),
    };

    let mut mapping = Vec::with_capacity(inherited.len());
    for (i, fd) in inherited.iter().enumerate() {
        let target = RawFd::try_from(FIRST_INHERITED_FD + i)
            .map_err(|e| DriverError::SpawnFailed(format!("too many inherited descriptors: {e}")))?;
        mapping.push((fd.as_raw_fd(), target));
    }

    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if !mapping.is_empty() {
        // SAFETY: runs in the forked child before exec and only calls dup2,
        // which is async-signal-safe. Every source descriptor sits above the
        // target range, so no dup2 clobbers a later source. dup2 clears
        // close-on-exec on the target.
        unsafe {
            cmd.pre_exec(move || {
                for &(src, target) in &mapping {
                    if libc::dup2(src, target) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    let child = cmd
        .spawn()
        .map_err(|e| DriverError::SpawnFailed(format!("exec {}: {e}", binary.display())))?;
    // The child holds its own copies now.
    drop(inherited);
    Ok(child)
}

/// Occupy every free descriptor below `end` for the duration of the spawn, so
/// the pipes `Command` opens internally cannot land where the child's
/// inherited descriptors will be placed.
fn reserve_target_range(template: &OwnedFd, end: usize) -> Result<Vec<OwnedFd>, DriverError> {
    let floor = RawFd::try_from(FIRST_INHERITED_FD)
        .map_err(|e| DriverError::SpawnFailed(e.to_string()))?;
    let mut held = Vec::new();
    loop {
        // SAFETY: `template` is an open descriptor.
        let dup = unsafe { libc::fcntl(template.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
        if dup == -1 {
            return Err(DriverError::Io(io::Error::last_os_error()));
        }
        // SAFETY: fcntl returned a fresh descriptor nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(dup) };
        if usize::try_from(dup).map_or(true, |n| n >= end) {
            return Ok(held);
        }
        held.push(fd);
    }
}

/// Duplicate `files` above the inherited range, close-on-exec.
fn relocate(files: &[OwnedFd]) -> Result<Vec<OwnedFd>, DriverError> {
    let floor = RawFd::try_from(FIRST_INHERITED_FD + files.len())
        .map_err(|e| DriverError::SpawnFailed(format!("too many inherited descriptors: {e}")))?;
    files
        .iter()
        .map(|fd| {
            // SAFETY: `fd` is an open descriptor borrowed from `files`.
            let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
            if dup == -1 {
                return Err(DriverError::Io(io::Error::last_os_error()));
            }
            // SAFETY: fcntl returned a fresh descriptor nothing else owns.
            Ok(unsafe { OwnedFd::from_raw_fd(dup) })
        })
        .collect()
}

/// Longest emulator output line logged as one record. Longer runs are split.
const MAX_LOG_LINE: usize = 64 * 1024;

fn log_pipe<R>(reader: R, stream: &'static str, instance: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            match next_log_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => tracing::debug!(%instance, stream, "qemu[{stream}]: {line}"),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%instance, stream, error = %e, "emulator pipe read failed");
                    break;
                }
            }
        }
    });
}

/// Read one line of at most [`MAX_LOG_LINE`] bytes, without its terminator.
async fn next_log_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let cap = u64::try_from(MAX_LOG_LINE).unwrap_or(u64::MAX);
    if reader.take(cap).read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_owned()))
}

async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    notifier: ExitNotifier,
    instance: String,
    started_at: DateTime<Utc>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(%instance, error = %e, "failed to kill QEMU");
            }
            child.wait().await
        }
    };
    let exit = exit_outcome(status);
    let uptime_secs = (Utc::now() - started_at).num_seconds();
    match &exit {
        Ok(()) => tracing::debug!(%instance, uptime_secs, "QEMU process exited cleanly"),
        Err(e) => tracing::debug!(%instance, uptime_secs, error = %e, "QEMU process exited"),
    }
    notifier.deliver(exit);
}

fn exit_outcome(status: io::Result<ExitStatus>) -> ProcessExit {
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(ExitError::Status(status)),
        Err(e) => Err(ExitError::Wait(e.to_string())),
    }
}
