//! # herd-core - Core Types
//!
//! Foundation crate for droidherd. Provides the error taxonomy, logging
//! setup and the small value types every other crate shares.
//!
//! This crate has **zero internal dependencies**.
//!
//! ## Public API
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum; [`Error::is_connection_error()`] is the retry trigger
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Types (`types`)
//! - [`ScannerId`] - Non-owning reference from a connection to its scanner
//! - [`TransferOptions`] - Cancellation token and progress callback for push/pull
//! - [`ProgressTracker`] - Clamped, monotonic progress reporting
//!
//! ## Prelude
//!
//! ```rust
//! use herd_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod types;

/// Prelude for common imports used throughout all droidherd crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

pub use error::{Error, Result, ResultExt};
pub use types::{ProgressFn, ProgressTracker, ScannerId, TransferOptions};
