//! Tracing subscriber initialization.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::domain::models::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// level. When a log directory is configured, output goes to a
/// daily-rotated file through a non-blocking writer; the returned guard
/// must be held for the process lifetime or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    let json = config.format == "json";

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "gantry.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let result = if json {
                registry
                    .with(fmt::layer().json().with_writer(writer).with_ansi(false))
                    .try_init()
            } else {
                registry
                    .with(fmt::layer().with_writer(writer).with_ansi(false))
                    .try_init()
            };
            if result.is_err() {
                tracing::debug!("tracing subscriber already installed");
            }
            Some(guard)
        }
        None => {
            let result = if json {
                registry.with(fmt::layer().json()).try_init()
            } else {
                registry.with(fmt::layer()).try_init()
            };
            if result.is_err() {
                tracing::debug!("tracing subscriber already installed");
            }
            None
        }
    }
}
