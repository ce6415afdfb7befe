//! Tracing setup: stdout always, plus an optional log file

use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFileConfig;
use crate::error::{RelayError, Result};

/// Name of the log file inside the configured directory
pub const LOG_FILE_NAME: &str = "chatrelay.log";

const DEFAULT_FILTER: &str = "info,chatrelay=debug";

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped, so it has to be
/// held until shutdown. A log file that cannot be opened is reported and
/// skipped; stdout logging still comes up.
pub fn init(config: &LogFileConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let mut file_error = None;
    let (file_layer, guard) = match config.enabled.then(|| file_writer(&config.dir)) {
        Some(Ok((writer, guard))) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            file_error = Some(e);
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!("File logging disabled: {e}");
    } else if guard.is_some() {
        tracing::info!("Logging to {}", config.dir.join(LOG_FILE_NAME).display());
    }

    guard
}

/// Non-blocking writer appending to `<dir>/chatrelay.log`, creating `dir`
/// if needed
pub fn file_writer(dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_NAME)
        .build(dir)
        .map_err(|e| {
            RelayError::Config(format!(
                "Failed to open log file in {}: {e}",
                dir.display()
            ))
        })?;

    Ok(tracing_appender::non_blocking(appender))
}
