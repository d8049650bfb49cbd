//! Logging setup: a file through a non-blocking appender, or stderr.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// RUST_LOG wins over the configured level. The returned guard flushes the
/// file writer on drop, so keep it alive until exit.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", config.level, e))?;

  match &config.file {
    Some(path) => {
      let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => std::path::Path::new("."),
      };
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

      let appender = tracing_appender::rolling::never(directory, file_name);
      let (non_blocking, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(filter),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .with_filter(filter),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;

      Ok(None)
    }
  }
}
