//! Core library for the piawg reconciler
//!
//! This crate carries the whole reconciliation engine: token and region
//! caching, peer registration, idempotent tunnel state reconciliation,
//! and the port-forward lease lifecycle. The binary crate only layers
//! CLI parsing and exit-status mapping on top.

pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod forward;
pub mod keys;
pub mod reconcile;
pub mod registrar;
pub mod requirements;
pub mod retry;
pub mod state;
pub mod tunnel;

use config::LogLevel;

/// Initialize logging infrastructure
///
/// Logs to the systemd journal when running under a unit (the expected
/// deployment is a timer-triggered service); otherwise to stderr.
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(level.to_filter())
                .init();
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(level.to_filter())
        .init();

    Ok(())
}
