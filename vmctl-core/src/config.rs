//! Instance configuration snapshot consumed by the driver.
//!
//! The on-disk schema that produces these values lives elsewhere; this module
//! only models the fields the driver reads.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which virtual machine monitor backs the instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum VmType {
    /// QEMU full-system emulation.
    #[default]
    Qemu,
    /// Apple Virtualization.framework.
    Vz,
}

impl VmType {
    /// Lowercase name used in file names and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Vz => "vz",
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How host directories are shared into the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MountType {
    /// SSHFS served from the host over a reverse SSH connection.
    #[default]
    #[serde(rename = "reverse-sshfs")]
    ReverseSshfs,
    /// virtio-9p.
    #[serde(rename = "9p")]
    NineP,
    /// virtio-fs.
    #[serde(rename = "virtiofs")]
    Virtiofs,
}

impl MountType {
    /// Name as written in the instance configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReverseSshfs => "reverse-sshfs",
            Self::NineP => "9p",
            Self::Virtiofs => "virtiofs",
        }
    }
}

impl fmt::Display for MountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Networking mode of a single guest NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum NetworkMode {
    /// User-space networking behind a forwarding service.
    Usernet,
    /// Host-shared network.
    Shared,
    /// Bridged onto a host interface.
    Bridged,
    /// Host-only network.
    Host,
}

/// One entry of the instance's `networks` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct NetworkConfig {
    /// Network name, used to locate its runtime directory.
    pub name: String,

    /// Networking mode.
    pub mode: NetworkMode,

    /// Explicit path to the network's endpoint socket, if not the default one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_socket: Option<PathBuf>,
}

impl NetworkConfig {
    /// Create a network entry using the default endpoint socket location.
    #[must_use]
    pub fn new(name: impl Into<String>, mode: NetworkMode) -> Self {
        Self {
            name: name.into(),
            mode,
            endpoint_socket: None,
        }
    }

    /// Override the endpoint socket path.
    #[must_use]
    pub fn with_endpoint_socket(mut self, path: PathBuf) -> Self {
        self.endpoint_socket = Some(path);
        self
    }
}

/// Immutable configuration snapshot of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InstanceConfig {
    /// Virtual machine monitor type.
    #[serde(default)]
    pub vm_type: VmType,

    /// Directory sharing mechanism.
    #[serde(default)]
    pub mount_type: MountType,

    /// Guest NICs in declaration order.
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

impl InstanceConfig {
    /// Index of the first user-space network, if any.
    #[must_use]
    pub fn first_usernet_index(&self) -> Option<usize> {
        self.networks
            .iter()
            .position(|n| n.mode == NetworkMode::Usernet)
    }

    /// The first user-space network, if any.
    #[must_use]
    pub fn first_usernet(&self) -> Option<&NetworkConfig> {
        self.first_usernet_index().map(|i| &self.networks[i])
    }

    /// Replace the network list.
    #[must_use]
    pub fn with_networks(mut self, networks: Vec<NetworkConfig>) -> Self {
        self.networks = networks;
        self
    }

    /// Replace the mount type.
    #[must_use]
    pub fn with_mount_type(mut self, mount_type: MountType) -> Self {
        self.mount_type = mount_type;
        self
    }
}
