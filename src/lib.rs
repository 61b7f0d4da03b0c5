//! droidherd Library
//!
//! Command line front end for the device registry: argument parsing,
//! fleet-wide commands, NDJSON event output and signal handling.

pub mod cli;
pub mod fleet;
pub mod headless;
pub mod runner;
pub mod signals;

// Re-export main entry points
pub use cli::{Args, Command};
pub use fleet::Fleet;
pub use runner::{run, run_command};
