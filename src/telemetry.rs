//! Structured logging setup. Mirrors the teacher's foreground/background
//! tracing initialization, minus the OpenTelemetry export layer — this crate
//! is a library consumed by a daemon, not the daemon itself.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Build an `EnvFilter` from `GUPPY_LOG`, falling back to `info` for this
/// crate and `warn` for dependencies when unset.
fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_env("GUPPY_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn,guppy_core=info"))
}

/// Initialize a stderr-only subscriber for interactive/foreground use.
/// Returns a guard that must be kept alive for the duration of the process.
pub fn init_foreground_tracing() -> tracing::subscriber::DefaultGuard {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(fmt_layer);
    tracing::subscriber::set_default(subscriber)
}

/// Initialize a rolling-daily file subscriber plus stderr, for background/
/// daemonized use. Returns the non-blocking writer guard — dropping it
/// stops the background flush thread, so callers must hold it for the
/// process lifetime (`std::mem::forget` if the guard can't be threaded
/// through main).
pub fn init_background_tracing(log_dir: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, "guppy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(build_env_filter())
        .with(fmt_layer)
        .init();

    guard
}
