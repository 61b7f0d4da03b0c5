//! Configuration file parsing for droidherd
//!
//! Supports `<config_dir>/droidherd/config.toml`, or any file passed with
//! `--config`.

pub mod settings;
pub mod types;

pub use settings::{default_config_path, load_settings, load_settings_from};
pub use types::*;
