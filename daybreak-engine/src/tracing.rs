//! Tracing setup and the prelude used throughout the crate.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Macros every module pulls in with `use crate::tracing::prelude::*;`.
pub mod prelude {
    pub use tracing::{debug, error, info, trace, warn};
}

/// Environment variable controlling the log filter (e.g. `daybreak=debug`).
pub const LOG_ENV: &str = "DAYBREAK_LOG";

/// Initialize the global subscriber for the daemon.
///
/// Logs to journald when a journal socket is available, otherwise to
/// stderr with local-time timestamps. The filter comes from `DAYBREAK_LOG`,
/// defaulting to `info`.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    match tracing_journald::layer() {
        Ok(journald) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(journald)
                .init();
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_timer(fmt::time::LocalTime::rfc_3339()))
                .init();
        }
    }
}
