//! QEMU lifecycle driver for vmctl instances.
//!
//! Launches the emulator with templated arguments and inherited sockets,
//! supervises its output and exit, talks QMP for power-down and display
//! control, and coordinates a graceful-then-forced shutdown.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

mod cleanup;
pub mod config;
pub mod driver;
pub mod error;
pub mod exit;
pub mod process;
pub mod qmp;
pub mod shutdown;
pub mod snapshot;
pub mod template;
mod unix_client;
pub mod usernet;

pub use config::{DriverOptions, LaunchConfig};
pub use driver::QemuDriver;
pub use error::{DriverError, ExitError};
pub use exit::{ExitSignal, ProcessExit};
pub use process::{start_emulator, Cmdline, EmulatorProcess};
pub use qmp::QmpSession;
pub use shutdown::{ShutdownPath, ShutdownReport, ShutdownState};
pub use snapshot::{parse_snapshot_tags, ImageBackend};
pub use template::{ArgTemplater, FdConnector, UnixFdConnector};
pub use usernet::{PortForwarder, UsernetClient};
