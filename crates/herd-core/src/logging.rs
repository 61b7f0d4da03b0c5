//! File logging for the droidherd CLI
//!
//! stdout belongs to command output and NDJSON events, so tracing output
//! never goes there. Every run appends to a daily file under the user's data
//! directory instead.

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "DROIDHERD_LOG";

/// Info for the droidherd crates, warnings from everything else
pub const DEFAULT_FILTER: &str = "droidherd=info,herd_app=info,herd_bridge=info,warn";

const LOG_FILE_PREFIX: &str = "droidherd.log";

/// Install the global subscriber.
///
/// ```bash
/// DROIDHERD_LOG=herd_app::persistent=trace droidherd exec -- uptime
/// ```
pub fn init() -> Result<()> {
    let dir = log_directory();
    std::fs::create_dir_all(&dir)?;

    let requested = std::env::var(LOG_ENV).ok();
    let (filter, rejected) = match EnvFilter::try_new(filter_directives(requested.as_deref())) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(DEFAULT_FILTER), Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, &dir, LOG_FILE_PREFIX))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!(
        "droidherd {} (pid {}) logging to {}",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        dir.display()
    );
    if let Some(e) = rejected {
        tracing::warn!("Ignoring {}: {}", LOG_ENV, e);
    }
    Ok(())
}

/// Filter directives to use given the raw `DROIDHERD_LOG` value
fn filter_directives(requested: Option<&str>) -> &str {
    match requested.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => DEFAULT_FILTER,
    }
}

/// `<data_local_dir>/droidherd/logs`, or `./droidherd/logs` without a home
pub fn log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("droidherd")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_live_under_droidherd_dir() {
        assert!(log_directory().ends_with("droidherd/logs"));
    }

    #[test]
    fn test_unset_or_blank_variable_uses_default_filter() {
        assert_eq!(filter_directives(None), DEFAULT_FILTER);
        assert_eq!(filter_directives(Some("  ")), DEFAULT_FILTER);
    }

    #[test]
    fn test_variable_overrides_default_filter() {
        assert_eq!(filter_directives(Some(" herd_app=trace ")), "herd_app=trace");
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
