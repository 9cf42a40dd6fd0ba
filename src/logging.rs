//! Structured logging setup: stderr always, plus an append-only file once
//! the logs directory is known, as two independent `tracing-subscriber`
//! layers sharing one `EnvFilter`. `DEBUG_MODE` picks the default level
//! when `RUST_LOG` isn't set.

use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the stderr-only subscriber used before `bootstrap-logs/` has
/// been created (e.g. while parsing arguments or failing PID-file checks).
pub fn init_stderr_only(debug_mode: bool) {
    tracing_subscriber::registry()
        .with(env_filter(debug_mode))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Installs the full subscriber: stderr plus a non-blocking appender onto
/// `bootstrap.log` in `logs_dir`. Returns the appender's guard, which the
/// caller must keep alive for the process lifetime or buffered lines are
/// lost on exit.
pub fn init_with_file(
    logs_dir: &Path,
    debug_mode: bool,
) -> std::io::Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(logs_dir, "bootstrap.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(debug_mode))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();

    Ok(guard)
}

fn env_filter(debug_mode: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_mode {
            EnvFilter::new("mirrornode_bootstrap=debug")
        } else {
            EnvFilter::new("mirrornode_bootstrap=info")
        }
    })
}
