//! Tracing setup for the `bleep` binary.
//!
//! stdout carries the JSON report, so every layer writes to stderr or to the
//! rolling log file.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::env_vars;

/// Flush guards of the non-blocking writers, held until exit.
static GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

const DEFAULT_LEVEL: &str = "info";
const FILE_PREFIX: &str = "bleep";

/// Where and how the run is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogProfile {
    /// Pretty stderr output with connect and enumeration spans.
    Interactive,
    /// JSON records in a daily log file plus compact stderr lines.
    Unattended,
}

impl LogProfile {
    /// Picks the profile from the `BLEEP_ENV` value.
    #[must_use]
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("production") => Self::Unattended,
            _ => Self::Interactive,
        }
    }
}

/// Builds the filter from `RUST_LOG`, then `BLEEP_LOG_LEVEL`, then `info`.
fn build_filter(level: Option<String>) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = level.unwrap_or_else(|| DEFAULT_LEVEL.to_string());
    EnvFilter::try_new(&level).with_context(|| format!("invalid log filter `{level}`"))
}

/// Installs the global subscriber for `profile`.
///
/// # Errors
///
/// Returns an error if the log filter does not parse.
pub fn init(profile: LogProfile) -> anyhow::Result<()> {
    let filter = build_filter(std::env::var(env_vars::LOG_LEVEL).ok())?;
    let mut guards = Vec::new();

    let (interactive, unattended, file) = match profile {
        LogProfile::Interactive => {
            let layer = fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);
            (Some(layer), None, None)
        }
        LogProfile::Unattended => {
            let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
            guards.push(guard);
            let compact = fmt::layer().compact().with_writer(stderr).with_ansi(false);

            let file = open_log_file().map(|appender| {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                guards.push(guard);
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
            });
            (None, Some(compact), file)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(interactive)
        .with(unattended)
        .with(file)
        .init();

    if GUARDS.set(guards).is_err() {
        tracing::debug!("Logging already initialized");
    }
    Ok(())
}

/// Opens the daily log file, or `None` when the directory is unusable.
fn open_log_file() -> Option<RollingFileAppender> {
    let dir = log_directory();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("bleep: cannot create log directory {}: {e}", dir.display());
        return None;
    }
    Some(RollingFileAppender::new(Rotation::DAILY, dir, FILE_PREFIX))
}

/// Per-user data directory, falling back to `./logs`.
fn log_directory() -> PathBuf {
    directories::ProjectDirs::from("", "", "bleep")
        .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
}
