//! Command line arguments

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// droidherd - Keep a fleet of Android devices reachable over USB and SSH
#[derive(Parser, Debug)]
#[command(name = "droidherd", version)]
#[command(about = "Run commands across a fleet of Android devices", long_about = None)]
pub struct Args {
    /// Settings file (default: <config dir>/droidherd/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print NDJSON events instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Only act on devices whose stable id starts with ID
    #[arg(long, short = 'd', global = true, value_name = "ID")]
    pub device: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Scan once and list every device with its connection state
    Devices,

    /// Run a shell command on every device
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Copy a local file to every device
    Push {
        local: PathBuf,
        remote: String,
        /// Write through `su`, for destinations only root can modify
        #[arg(long)]
        root: bool,
    },

    /// Copy a file from every device into LOCAL_DIR, one file per device
    Pull {
        remote: String,
        local_dir: PathBuf,
        /// Read through `su`, for files only root can access
        #[arg(long)]
        root: bool,
    },

    /// Reboot every device
    Reboot,

    /// Keep rescanning and print device events until interrupted
    Watch {
        /// Seconds between scans (default: from the config file)
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
}

impl Command {
    /// Joined `exec` arguments
    pub fn shell_command(&self) -> Option<String> {
        match self {
            Command::Exec { command } => Some(command.join(" ")),
            _ => None,
        }
    }
}
