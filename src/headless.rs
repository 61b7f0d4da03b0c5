//! Structured event output
//!
//! With `--json`, every event is written to stdout as NDJSON (one JSON object
//! per line) so scripts never have to parse human-oriented text. Each object
//! has an "event" field naming its type and a millisecond "timestamp".
//!
//! # Example Output
//!
//! ```json
//! {"event":"device_discovered","stable_id":"lab-phone-3","connection_id":"R58M12ABC","timestamp":1704700001000}
//! {"event":"device_disconnected","stable_id":"lab-phone-3","connection_id":"R58M12ABC","timestamp":1704700002000}
//! {"event":"command_output","stable_id":"lab-phone-3","command":"getprop ro.build.id","output":"UP1A\n","timestamp":1704700003000}
//! ```
//!
//! Without `--json` the same events are rendered as plain lines; warnings and
//! failures go to stderr.

use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;
use tracing::error;

use herd_app::{PersistentDevice, RegistryEvent};

/// Events emitted by the command line front end
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// One row of the `devices` listing
    DeviceListed {
        stable_id: String,
        connected: bool,
        connection_id: Option<String>,
        timestamp: i64,
    },

    /// A device was seen for the first time
    DeviceDiscovered {
        stable_id: String,
        connection_id: Option<String>,
        timestamp: i64,
    },

    /// A device lost its connection and is awaiting reconnect
    DeviceDisconnected {
        stable_id: String,
        connection_id: String,
        timestamp: i64,
    },

    /// A device got a new connection
    DeviceReconnected {
        stable_id: String,
        connection_id: String,
        timestamp: i64,
    },

    /// Advisory text from discovery
    Warning { message: String, timestamp: i64 },

    /// Output of `exec` on one device
    CommandOutput {
        stable_id: String,
        command: String,
        output: String,
        timestamp: i64,
    },

    /// Push or pull progress as a fraction in [0, 1]
    TransferProgress {
        stable_id: String,
        progress: f64,
        timestamp: i64,
    },

    /// An operation finished on one device
    OperationCompleted {
        stable_id: String,
        operation: String,
        detail: Option<String>,
        timestamp: i64,
    },

    /// An operation failed on one device
    OperationFailed {
        stable_id: String,
        operation: String,
        error: String,
        timestamp: i64,
    },

    /// Error not tied to a single device
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Plain-text rendering; `None` for events only scripts care about
    pub fn human_line(&self) -> Option<String> {
        let line = match self {
            Self::DeviceListed {
                stable_id,
                connected,
                connection_id,
                ..
            } => format!(
                "{}\t{}\t{}",
                stable_id,
                if *connected { "connected" } else { "awaiting reconnect" },
                connection_id.as_deref().unwrap_or("-")
            ),
            Self::DeviceDiscovered {
                stable_id,
                connection_id,
                ..
            } => format!(
                "+ {} ({})",
                stable_id,
                connection_id.as_deref().unwrap_or("no connection")
            ),
            Self::DeviceDisconnected {
                stable_id,
                connection_id,
                ..
            } => format!("- {} lost {}, awaiting reconnect", stable_id, connection_id),
            Self::DeviceReconnected {
                stable_id,
                connection_id,
                ..
            } => format!("~ {} reconnected via {}", stable_id, connection_id),
            Self::Warning { message, .. } => format!("warning: {}", message),
            Self::CommandOutput {
                stable_id, output, ..
            } => format!("=== {} ===\n{}", stable_id, output.trim_end()),
            Self::TransferProgress { .. } => return None,
            Self::OperationCompleted {
                stable_id,
                operation,
                detail,
                ..
            } => match detail {
                Some(detail) => format!("{}: {} done ({})", stable_id, operation, detail),
                None => format!("{}: {} done", stable_id, operation),
            },
            Self::OperationFailed {
                stable_id,
                operation,
                error,
                ..
            } => format!("{}: {} failed: {}", stable_id, operation, error),
            Self::Error { message, .. } => format!("error: {}", message),
        };
        Some(line)
    }

    /// Whether the plain rendering belongs on stderr
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            Self::Warning { .. } | Self::OperationFailed { .. } | Self::Error { .. }
        )
    }

    /// Translate a registry notification
    pub fn from_registry(event: &RegistryEvent) -> Self {
        match event {
            RegistryEvent::DeviceDiscovered(device) => Self::DeviceDiscovered {
                stable_id: device.stable_id().to_string(),
                connection_id: device.connection_id(),
                timestamp: Self::now(),
            },
            RegistryEvent::DiscoveryWarning(message) => Self::warning(message.clone()),
            RegistryEvent::DeviceDisconnected {
                stable_id,
                connection_id,
            } => Self::DeviceDisconnected {
                stable_id: stable_id.clone(),
                connection_id: connection_id.clone(),
                timestamp: Self::now(),
            },
            RegistryEvent::DeviceReconnected {
                stable_id,
                connection_id,
            } => Self::DeviceReconnected {
                stable_id: stable_id.clone(),
                connection_id: connection_id.clone(),
                timestamp: Self::now(),
            },
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn device_listed(device: &PersistentDevice) -> Self {
        let connection_id = device.connection_id();
        Self::DeviceListed {
            stable_id: device.stable_id().to_string(),
            connected: connection_id.is_some(),
            connection_id,
            timestamp: Self::now(),
        }
    }

    pub fn warning(message: String) -> Self {
        Self::Warning {
            message,
            timestamp: Self::now(),
        }
    }

    pub fn command_output(stable_id: &str, command: &str, output: String) -> Self {
        Self::CommandOutput {
            stable_id: stable_id.to_string(),
            command: command.to_string(),
            output,
            timestamp: Self::now(),
        }
    }

    pub fn transfer_progress(stable_id: &str, progress: f64) -> Self {
        Self::TransferProgress {
            stable_id: stable_id.to_string(),
            progress,
            timestamp: Self::now(),
        }
    }

    pub fn operation_completed(stable_id: &str, operation: &str, detail: Option<String>) -> Self {
        Self::OperationCompleted {
            stable_id: stable_id.to_string(),
            operation: operation.to_string(),
            detail,
            timestamp: Self::now(),
        }
    }

    pub fn operation_failed(stable_id: &str, operation: &str, error: String) -> Self {
        Self::OperationFailed {
            stable_id: stable_id.to_string(),
            operation: operation.to_string(),
            error,
            timestamp: Self::now(),
        }
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            fatal,
            timestamp: Self::now(),
        }
    }
}

/// How events reach the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Human
        }
    }

    pub fn emit(self, event: &HeadlessEvent) {
        match self {
            Self::Json => event.emit(),
            Self::Human => {
                let Some(line) = event.human_line() else {
                    return;
                };
                if event.is_diagnostic() {
                    eprintln!("{}", line);
                } else {
                    println!("{}", line);
                }
            }
        }
    }
}
