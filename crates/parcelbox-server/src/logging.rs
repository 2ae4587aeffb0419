//! Logging setup.
//!
//! - **Production**: daily rolling JSON files plus compact, colourless stdout for journald
//! - **Development**: pretty stdout with span open/close events
//!
//! The filter comes from `RUST_LOG`, then `PARCELBOX_LOG_LEVEL`, then `info`.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the fallback filter directive.
pub const LOG_LEVEL_ENV: &str = "PARCELBOX_LOG_LEVEL";

/// Prefix of the rolling log files.
const LOG_FILE_PREFIX: &str = "parcelbox";

/// Writer guards; dropping them would stop the background writers.
static GUARDS: OnceLock<(WorkerGuard, WorkerGuard)> = OnceLock::new();

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or, in production, the log
/// directory cannot be created.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let filter = env_filter()?;

    if is_production {
        init_production(filter, log_directory())
    } else {
        init_development(filter);
        Ok(())
    }
}

fn env_filter() -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    EnvFilter::try_new(&directive).with_context(|| format!("invalid {LOG_LEVEL_ENV} '{directive}'"))
}

fn init_production(filter: EnvFilter, log_dir: PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

    let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = GUARDS.set((file_guard, stdout_guard));
    tracing::debug!(log_dir = %log_dir.display(), "file logging enabled");
    Ok(())
}

fn init_development(filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .init();
}

/// `/var/log/parcelbox` on the box, the platform data dir elsewhere.
fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/parcelbox")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "parcelbox")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_is_valid_path() {
        let dir = log_directory();
        assert!(dir.ends_with("parcelbox") || dir.ends_with("logs"));
    }
}
