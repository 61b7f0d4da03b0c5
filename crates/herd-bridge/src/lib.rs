//! # herd-bridge - Device Transports
//!
//! Talks to devices. Defines the transport-agnostic [`Connection`] and
//! [`Scanner`] contracts and implements them over the `adb` and `ssh` command
//! line tools.
//!
//! Depends on [`herd_core`] for error handling and transfer options.
//!
//! ## Public API
//!
//! ### Contracts
//! - [`Connection`] - One live transport session to one device
//! - [`CommandResult`] / [`CommandWriter`] - Live shell command output and completion
//! - [`Scanner`] - Discovery strategy for one transport family
//! - [`ScanReporter`] / [`ScanEvent`] - How scanners publish discoveries and warnings
//!
//! ### USB debug bridge
//! - [`AdbScanner`], [`AdbConnection`] - Devices attached to the local adb server
//! - [`parse_devices_output()`] - Parse `adb devices` output
//!
//! ### Secure shell
//! - [`SshScanner`], [`SshConnection`] - Devices answering SSH on an address range
//! - [`SshScannerConfig`] - Address range, port and credentials
//!
//! ### Platform Utilities
//! - [`ToolAvailability`] - Locate `adb` and `ssh`

pub mod adb;
pub mod connection;
mod process;
pub mod scanner;
pub mod ssh;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tool_availability;

pub use adb::{parse_devices_output, AdbConnection, AdbListing, AdbScanner, AdbScannerConfig};
pub use connection::{CommandResult, CommandWriter, Connection};
pub use scanner::{PendingDiscoveries, ScanEvent, ScanReporter, Scanner};
pub use ssh::{address_range, SshConnection, SshScanner, SshScannerConfig};
pub use tool_availability::ToolAvailability;
