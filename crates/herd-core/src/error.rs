//! Error taxonomy shared by every droidherd layer

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors organized by the layer that raises them.
///
/// Only [`Error::Connection`] means the transport itself is broken. A
/// persistent device absorbs it by waiting for a new connection and retrying;
/// everything else reaches the caller unchanged.
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{tool}' not found. Ensure it is installed and in your PATH.")]
    ToolNotFound { tool: String },

    #[error("Failed to spawn {program}: {reason}")]
    ProcessSpawn { program: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Operation failed: {message}")]
    Operation { message: String },

    #[error("No such file on device: {path}")]
    NotFound { path: String },

    #[error("Operation cancelled")]
    Cancelled,

    // ─────────────────────────────────────────────────────────────
    // Discovery Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid scanner configuration: {message}")]
    Configuration { message: String },

    #[error("Malformed device identity: {message}")]
    Identity { message: String },

    #[error("Device {stable_id} has been shut down")]
    DeviceClosed { stable_id: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration File Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn identity(message: impl Into<String>) -> Self {
        Self::Identity {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    pub fn process_spawn(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProcessSpawn {
            program: program.into(),
            reason: reason.into(),
        }
    }

    pub fn device_closed(stable_id: impl Into<String>) -> Self {
        Self::DeviceClosed {
            stable_id: stable_id.into(),
        }
    }

    /// Whether the transport is broken and the operation should be retried
    /// against a fresh connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::Operation { .. }
                | Error::NotFound { .. }
                | Error::Cancelled
                | Error::Identity { .. }
        )
    }

    /// Check if this error should abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ToolNotFound { .. }
                | Error::Configuration { .. }
                | Error::Config { .. }
                | Error::ConfigNotFound { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::connection("socket reset");
        assert_eq!(err.to_string(), "Connection error: socket reset");

        let err = Error::tool_not_found("adb");
        assert!(err.to_string().contains("'adb' not found"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        // A local IO failure says nothing about the transport
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_only_connection_errors_trigger_retry() {
        assert!(Error::connection("reset").is_connection_error());
        assert!(!Error::operation("exit 1").is_connection_error());
        assert!(!Error::not_found("/sdcard/x").is_connection_error());
        assert!(!Error::Cancelled.is_connection_error());
        assert!(!Error::configuration("bad range").is_connection_error());
    }

    #[test]
    fn test_cancelled_is_distinct() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::connection("x").is_cancelled());
        assert_eq!(Error::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::tool_not_found("ssh").is_fatal());
        assert!(Error::configuration("start after end").is_fatal());
        assert!(!Error::connection("reset").is_fatal());
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::connection("reset").is_recoverable());
        assert!(Error::operation("exit 1").is_recoverable());
        assert!(Error::Cancelled.is_recoverable());
        assert!(!Error::tool_not_found("adb").is_recoverable());
    }

    #[test]
    fn test_device_closed_names_device() {
        let err = Error::device_closed("phone-7");
        assert!(err.to_string().contains("phone-7"));
    }

    #[test]
    fn test_context_preserves_error() {
        let result: std::result::Result<(), Error> = Err(Error::operation("boom"));
        let err = result.context("while testing").unwrap_err();
        assert!(matches!(err, Error::Operation { .. }));
    }
}
