use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use dotenv::dotenv;

use super::config::{LogConfig, LogRotation};
use super::{AppError, AppResult};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Keeps the background log writer alive; pending lines are flushed when it is dropped.
pub struct LogGuard {
    _worker_guard: WorkerGuard,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        tracing::info!("flushing log writer");
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

impl From<LogRotation> for Rotation {
    fn from(value: LogRotation) -> Self {
        match value {
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// stdout only, used by tests and local runs
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter("debug"))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))
}

/// Writes to stdout and to a rolling file under `config.dir`. The appender owns rotation,
/// so nothing else has to schedule it.
pub fn setup_tracing(config: &LogConfig) -> AppResult<LogGuard> {
    let file_appender =
        RollingFileAppender::new(config.rotation.into(), &config.dir, &config.file_name);

    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(&config.level))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))?;

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}
