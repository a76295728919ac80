//! Core types for the vmctl emulator driver.
//!
//! Defines the instance metadata, the configuration snapshot the driver is
//! handed, and small value types (snapshot tags, MAC addresses) shared by the
//! driver and its collaborators.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod filenames;
pub mod id;
pub mod instance;

pub use config::{InstanceConfig, MountType, NetworkConfig, NetworkMode, VmType};
pub use error::CoreError;
pub use id::{MacAddress, SnapshotTag};
pub use instance::{Instance, InstanceStatus};
