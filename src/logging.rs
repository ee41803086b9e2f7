use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "FIELDSYNC_LOG";

const DEFAULT_FILTER: &str = "fieldsync=info";

/// Default log directory ($XDG_DATA_HOME/fieldsync/logs).
pub fn default_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("fieldsync").join("logs"))
}

/// Install the global subscriber, writing to a daily rolling file.
///
/// Keep the returned guard alive for the life of the process; dropping it flushes
/// and stops the writer thread.
pub fn init(dir: Option<PathBuf>) -> Result<WorkerGuard> {
  let dir = match dir {
    Some(dir) => dir,
    None => default_dir()?,
  };
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "fieldsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
