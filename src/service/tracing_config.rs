use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::LogLevel;

/// Keeps the non-blocking file writer flushing; drop it last.
pub struct LogGuard {
    _worker_guard: WorkerGuard,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        tracing::info!("shutdown log writer");
    }
}

// RUST_LOG wins over the configured level when it is set
fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
}

/// Stdout-only tracing, used by tests and embedding applications.
pub fn setup_local_tracing(level: LogLevel) {
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    // a subscriber may already be installed by an earlier test
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(level))
        .try_init();
}

/// Stdout plus an hourly-rolled file under `log_dir`.
pub fn setup_tracing<P: AsRef<Path>>(level: LogLevel, log_dir: P) -> LogGuard {
    let file_appender = tracing_appender::rolling::hourly(log_dir, "synapse.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    // write to both the console and the file
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(level))
        .try_init();

    LogGuard {
        _worker_guard: worker_guard,
    }
}
