//! Launch configuration and driver tunables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmctl_core::{Instance, InstanceConfig, NetworkConfig};

/// Default bound on graceful power-down before the emulator is killed.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Default bound on waiting for the control socket to appear.
pub const DEFAULT_SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default poll interval while waiting for the control socket.
pub const DEFAULT_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default bound on connecting to, and each exchange with, the control socket.
pub const DEFAULT_QMP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a single request to the network forwarding service.
pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to compute the emulator command line for one instance.
///
/// Built fresh for every operation and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct LaunchConfig {
    /// Instance name.
    pub name: String,
    /// Instance directory.
    pub instance_dir: PathBuf,
    /// Configuration snapshot.
    pub config: InstanceConfig,
    /// Host port forwarded to the guest SSH server; `0` when irrelevant.
    pub ssh_local_port: u16,
}

impl LaunchConfig {
    /// Build the launch configuration of `instance`.
    #[must_use]
    pub fn new(instance: &Instance, config: &InstanceConfig, ssh_local_port: u16) -> Self {
        Self {
            name: instance.name.clone(),
            instance_dir: instance.dir.clone(),
            config: config.clone(),
            ssh_local_port,
        }
    }
}

/// Time bounds and paths used by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DriverOptions {
    /// How long to wait for the emulator to exit after a power-down request.
    pub shutdown_timeout: Duration,
    /// How long to wait for the control socket to appear.
    pub socket_wait_timeout: Duration,
    /// Poll interval while waiting for the control socket.
    pub socket_poll_interval: Duration,
    /// Connect and per-command bound on control sessions.
    pub qmp_timeout: Duration,
    /// Bound on each call to the network forwarding service.
    pub bridge_timeout: Duration,
    /// Directory holding per-network runtime directories.
    pub networks_dir: PathBuf,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            socket_wait_timeout: DEFAULT_SOCKET_WAIT_TIMEOUT,
            socket_poll_interval: DEFAULT_SOCKET_POLL_INTERVAL,
            qmp_timeout: DEFAULT_QMP_TIMEOUT,
            bridge_timeout: DEFAULT_BRIDGE_TIMEOUT,
            networks_dir: default_networks_dir(),
        }
    }
}

impl DriverOptions {
    /// Defaults overridden by `VMCTL_SHUTDOWN_TIMEOUT_SECS`,
    /// `VMCTL_QMP_TIMEOUT_SECS`, `VMCTL_BRIDGE_TIMEOUT_SECS` and
    /// `VMCTL_NETWORKS_DIR`.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(secs) = env_secs("VMCTL_SHUTDOWN_TIMEOUT_SECS") {
            opts.shutdown_timeout = secs;
        }
        if let Some(secs) = env_secs("VMCTL_QMP_TIMEOUT_SECS") {
            opts.qmp_timeout = secs;
        }
        if let Some(secs) = env_secs("VMCTL_BRIDGE_TIMEOUT_SECS") {
            opts.bridge_timeout = secs;
        }
        if let Some(dir) = std::env::var_os("VMCTL_NETWORKS_DIR") {
            opts.networks_dir = PathBuf::from(dir);
        }
        opts
    }

    /// Set the graceful shutdown bound.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the control socket wait bound and poll interval.
    #[must_use]
    pub fn with_socket_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.socket_wait_timeout = timeout;
        self.socket_poll_interval = poll_interval;
        self
    }

    /// Set the control session bound.
    #[must_use]
    pub fn with_qmp_timeout(mut self, timeout: Duration) -> Self {
        self.qmp_timeout = timeout;
        self
    }

    /// Set the network forwarding service bound.
    #[must_use]
    pub fn with_bridge_timeout(mut self, timeout: Duration) -> Self {
        self.bridge_timeout = timeout;
        self
    }

    /// Set the networks runtime directory.
    #[must_use]
    pub fn with_networks_dir(mut self, dir: PathBuf) -> Self {
        self.networks_dir = dir;
        self
    }

    /// Endpoint socket of a user-space network.
    ///
    /// `<networks_dir>/<name>/<name>_ep.sock` unless the network names one.
    #[must_use]
    pub fn usernet_endpoint(&self, network: &NetworkConfig) -> PathBuf {
        network.endpoint_socket.clone().unwrap_or_else(|| {
            self.networks_dir
                .join(&network.name)
                .join(format!("{}_ep.sock", network.name))
        })
    }
}

fn default_networks_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(".vmctl")
        .join("_networks")
}

fn env_secs(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            tracing::warn!(%key, value = %raw, error = %e, "ignoring invalid duration");
            None
        }
    }
}
