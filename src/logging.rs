use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Install the global subscriber.
///
/// Filter comes from `HARBOR_LOG` (default `info`). With `log_dir` set,
/// output goes to a daily rolling file; the returned guard must be kept
/// alive to flush it.
pub fn init(config: &Config) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("HARBOR_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  match &config.log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "harbor.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

      Ok(None)
    }
  }
}
