use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;
use crate::error::{GatewayError, Result};

const LOG_FILE_PREFIX: &str = "kernelhub.log";

/// Install the global subscriber.
///
/// Always logs to stderr; when `logging.directory` is set, also writes a
/// daily-rotated file there. The filter comes from RUST_LOG and defaults to
/// `info`. Keep the returned guard alive for as long as file logging is
/// needed.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| GatewayError::Configuration(format!("Failed to initialize tracing: {e}")))?;

    if let Some(dir) = &config.directory {
        ::tracing::debug!(path = %dir.display(), "File logging enabled");
    }
    Ok(guard)
}
