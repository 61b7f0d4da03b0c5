//! herd-app - Persistent devices and fleet orchestration for droidherd
//!
//! This crate turns short-lived transport connections into long-lived
//! devices. A [`PersistentDevice`] survives any number of reconnects; the
//! [`DeviceRegistry`] runs scanners, resolves each connection to a stable
//! identity and hands it to the right device.
//!
//! ## Public API
//!
//! - [`PersistentDevice`] / [`DeviceEvent`] - Retry-on-reconnect wrapper around one device
//! - [`DeviceRegistry`] / [`RegistryEvent`] / [`RegistryOptions`] - Discovery and merging
//! - [`IdentityResolver`] - Marker-file based stable identity
//! - [`RediscoveryPolicy`] - Limits for re-probing lost devices
//! - [`config`] - `config.toml` loading and scanner construction

pub mod config;
pub mod identity;
pub mod persistent;
pub mod rediscovery;
pub mod registry;

pub use config::{load_settings, load_settings_from, Settings};
pub use identity::{IdentityResolver, DEFAULT_MARKER_PATH};
pub use persistent::{DeviceEvent, PersistentDevice};
pub use rediscovery::RediscoveryPolicy;
pub use registry::{DeviceRegistry, RegistryEvent, RegistryOptions};
