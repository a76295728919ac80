//! The QEMU driver facade.
//!
//! [`QemuDriver`] owns at most one live [`EmulatorProcess`] per instance.
//! Callers serialize operations on one driver; there is no internal lock.

use std::sync::Arc;

use vmctl_core::{CoreError, Instance, InstanceConfig, MountType, SnapshotTag};

use crate::process::{start_emulator, Cmdline, EmulatorProcess};
use crate::qmp::{wait_for_socket, QmpSession};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::snapshot::ImageBackend;
use crate::template::ArgTemplater;
use crate::usernet::{PortForwarder, UsernetClient};
use crate::{DriverError, DriverOptions, ExitSignal, LaunchConfig};

const DRIVER_NAME: &str = "QEMU";

/// Drives one QEMU instance.
pub struct QemuDriver {
    instance: Instance,
    config: InstanceConfig,
    ssh_local_port: u16,
    options: DriverOptions,
    cmdline: Arc<dyn Cmdline>,
    images: Arc<dyn ImageBackend>,
    forwarder: Option<Arc<dyn PortForwarder>>,
    process: Option<EmulatorProcess>,
}

impl std::fmt::Debug for QemuDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QemuDriver")
            .field("instance", &self.instance)
            .field("ssh_local_port", &self.ssh_local_port)
            .field("options", &self.options)
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

impl QemuDriver {
    /// Create a driver for `instance` with default options.
    ///
    /// `cmdline` builds the emulator command line and `images` performs disk
    /// and snapshot work.
    #[must_use]
    pub fn new(
        instance: Instance,
        config: InstanceConfig,
        ssh_local_port: u16,
        cmdline: Arc<dyn Cmdline>,
        images: Arc<dyn ImageBackend>,
    ) -> Self {
        Self {
            instance,
            config,
            ssh_local_port,
            options: DriverOptions::default(),
            cmdline,
            images,
            forwarder: None,
            process: None,
        }
    }

    /// Replace the driver options.
    #[must_use]
    pub fn with_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `forwarder` instead of the usernet endpoint client.
    ///
    /// Only consulted when the instance has a user-space network.
    #[must_use]
    pub fn with_forwarder(mut self, forwarder: Arc<dyn PortForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// The instance this driver manages.
    #[must_use]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The live emulator, if started.
    #[must_use]
    pub fn process(&self) -> Option<&EmulatorProcess> {
        self.process.as_ref()
    }

    fn launch_config(&self) -> LaunchConfig {
        LaunchConfig::new(&self.instance, &self.config, self.ssh_local_port)
    }

    /// Port forwarder for the first user-space network, if there is one.
    fn port_forwarder(&self) -> Option<Arc<dyn PortForwarder>> {
        let network = self.config.first_usernet()?;
        Some(self.forwarder.clone().unwrap_or_else(|| {
            Arc::new(
                UsernetClient::new(self.options.usernet_endpoint(network))
                    .with_request_timeout(self.options.bridge_timeout),
            )
        }))
    }

    /// Check that the configuration can be served by this driver.
    ///
    /// # Errors
    /// Returns [`DriverError::Config`] for an unsupported mount type.
    pub fn validate(&self) -> Result<(), DriverError> {
        match self.config.mount_type {
            MountType::ReverseSshfs | MountType::NineP => Ok(()),
            other => Err(CoreError::UnsupportedMountType {
                driver: DRIVER_NAME,
                allowed: format!("{:?} or {:?}", MountType::ReverseSshfs.as_str(), MountType::NineP.as_str()),
                got: other.to_string(),
            }
            .into()),
        }
    }

    /// Create the instance disk if missing.
    ///
    /// # Errors
    /// Propagates [`ImageBackend::ensure_disk`] failures.
    pub async fn create_disk(&self) -> Result<(), DriverError> {
        let cfg = LaunchConfig::new(&self.instance, &self.config, 0);
        self.images.ensure_disk(&cfg).await
    }

    /// Launch the emulator and return its exit signal.
    ///
    /// # Errors
    /// Returns [`DriverError::AlreadyStarted`] while a process is live, and
    /// any command-line, template or spawn error from the supervisor.
    pub async fn start(&mut self) -> Result<ExitSignal, DriverError> {
        if self.process.is_some() {
            return Err(DriverError::AlreadyStarted);
        }
        let cfg = self.launch_config();
        let process = start_emulator(
            self.cmdline.as_ref(),
            ArgTemplater::new(),
            &cfg,
            self.port_forwarder(),
        )?;
        let signal = process.exit_signal();
        self.process = Some(process);
        Ok(signal)
    }

    /// Stop the emulator and return its exit outcome.
    ///
    /// # Errors
    /// Returns [`DriverError::NotStarted`] without a live process and
    /// [`DriverError::Process`] if the emulator exited unsuccessfully
    /// (including when it had to be killed).
    pub async fn stop(&mut self) -> Result<(), DriverError> {
        self.shutdown().await?.exit.map_err(DriverError::Process)
    }

    /// Stop the emulator and report how it went down.
    ///
    /// # Errors
    /// Returns [`DriverError::NotStarted`] without a live process.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, DriverError> {
        let Some(mut process) = self.process.take() else {
            return Err(DriverError::NotStarted);
        };
        tracing::info!(instance = %self.instance.name, pid = ?process.pid(), "shutting down QEMU");

        let mut coordinator = ShutdownCoordinator::new(
            self.instance.name.clone(),
            self.instance.dir.clone(),
            self.config.vm_type,
            self.options.shutdown_timeout,
            self.options.qmp_timeout,
        );
        if let Some(forwarder) = self.port_forwarder() {
            coordinator = coordinator.with_unforward(
                forwarder,
                self.ssh_local_port,
                self.options.bridge_timeout,
            );
        }
        Ok(coordinator.run(&mut process).await)
    }

    /// Save a snapshot named `tag`.
    ///
    /// # Errors
    /// Returns [`DriverError::Config`] for an empty tag, before anything else
    /// is touched, otherwise propagates the image backend's error.
    pub async fn create_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        let tag = SnapshotTag::new(tag)?;
        self.images
            .save_snapshot(&self.launch_config(), self.instance.is_running(), &tag)
            .await
    }

    /// Delete the snapshot named `tag`.
    ///
    /// # Errors
    /// See [`QemuDriver::create_snapshot`].
    pub async fn delete_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        let tag = SnapshotTag::new(tag)?;
        self.images
            .delete_snapshot(&self.launch_config(), self.instance.is_running(), &tag)
            .await
    }

    /// Revert to the snapshot named `tag`.
    ///
    /// # Errors
    /// See [`QemuDriver::create_snapshot`].
    pub async fn apply_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        let tag = SnapshotTag::new(tag)?;
        self.images
            .load_snapshot(&self.launch_config(), self.instance.is_running(), &tag)
            .await
    }

    /// The image backend's snapshot listing.
    ///
    /// # Errors
    /// Propagates the image backend's error.
    pub async fn list_snapshots(&self) -> Result<String, DriverError> {
        self.images
            .list_snapshots(&self.launch_config(), self.instance.is_running())
            .await
    }

    /// Set the display server password.
    ///
    /// Waits for the control socket to appear first, since this may run right
    /// after [`QemuDriver::start`].
    ///
    /// # Errors
    /// Returns [`DriverError::SocketTimeout`] if the socket never appears, and
    /// any session error.
    pub async fn change_display_password(&self, password: &str) -> Result<(), DriverError> {
        let socket = self.instance.qmp_socket();
        wait_for_socket(
            &socket,
            self.options.socket_wait_timeout,
            self.options.socket_poll_interval,
        )
        .await?;
        let mut session = QmpSession::connect(&socket, self.options.qmp_timeout).await?;
        let res = session.change_vnc_password(password).await;
        session.disconnect().await;
        res
    }

    /// The display server's service address.
    ///
    /// # Errors
    /// Any session error.
    pub async fn get_display_connection(&self) -> Result<String, DriverError> {
        let mut session =
            QmpSession::connect(&self.instance.qmp_socket(), self.options.qmp_timeout).await?;
        let res = session.query_vnc_service().await;
        session.disconnect().await;
        res
    }
}
