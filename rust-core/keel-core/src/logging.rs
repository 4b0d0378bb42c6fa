//! # Logging
//!
//! Installs the global `tracing` subscriber.

use crate::config::LogFormat;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "keel=info";

/// Install the global subscriber
///
/// Returns `false` when a subscriber was already installed, so calling this
/// more than once is harmless.
pub fn init(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt().with_env_filter(filter).with_target(true);

    let installed = match format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.is_ok()
}
