//! File-based logging for the probe.
//!
//! stdout belongs to command output (collector scripts parse it), so tracing
//! goes to a daily-rotated file under `~/.shopfloor/logs/`. Logging is
//! best-effort: when the log directory cannot be created the probe runs
//! silently rather than failing.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn init() -> Option<WorkerGuard> {
    let home = dirs::home_dir()?;
    let log_dir = home.join(".shopfloor").join("logs");
    if fs_err::create_dir_all(&log_dir).is_err() {
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, "probe.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let debug_enabled = env::var("SHOPFLOOR_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Some(guard)
}
