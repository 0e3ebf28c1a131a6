//! Logging setup shared by Katbot binaries.
//!
//! Libraries only emit `tracing` events; binaries call [`setup_logging`]
//! once at startup and keep the returned [`LogGuard`] alive until exit.
//!
//! ```rust,no_run
//! use katbot_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), katbot_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("katbot_plugins=debug");
//! let _guard = setup_logging(&config)?;
//! tracing::info!("ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{FileLogConfig, FileRotation, LogConfig, LogFormat, LogGuard, LogTarget, setup_logging};
