//! Tracing subscriber setup for embedders that want the store to own it.
//!
//! Everything in the crate emits through `tracing`, so an application that
//! already installs its own subscriber gets vellum's diagnostics for free
//! and never needs this module. For everything else, [`init_logging`] wires
//! up a subscriber once per process: human-readable lines on stderr by
//! default, JSON lines or a file destination when asked.
//!
//! Per the store's error discipline, caller mistakes (revision conflicts,
//! command-id reuse, ...) are returned, not logged; only environmental
//! trouble and worker lifecycle show up here. Event payload bytes never
//! reach a log line.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Set once the process-global subscriber is in place.
static SUBSCRIBER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines for interactive use.
    #[default]
    Pretty,
    /// One JSON object per line, for collectors and CI.
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, e.g. `"info"` or `"vellum_core=debug"`.
    /// A `RUST_LOG` environment variable wins over this when present.
    pub filter: String,
    /// Line rendering.
    pub format: LogFormat,
    /// Send output to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

/// Ways [`init_logging`] can fail.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("a tracing subscriber is already installed for this process")]
    SubscriberInstalled,

    #[error("unparseable filter directive {0:?}")]
    BadFilter(String),

    #[error("could not open the log file: {0}")]
    OpenLogFile(#[from] io::Error),

    #[error(transparent)]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the process-global tracing subscriber. Callable at most once;
/// later calls fail with [`LogError::SubscriberInstalled`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    // The configured directive must parse even when RUST_LOG overrides it,
    // so a config typo surfaces on every machine, not just unset ones.
    let configured = EnvFilter::try_new(&config.filter)
        .map_err(|_| LogError::BadFilter(config.filter.clone()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    if SUBSCRIBER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(LogError::SubscriberInstalled);
    }
    let installed = install(config, filter);
    if installed.is_err() {
        // Leave the slot open so a corrected config can try again.
        SUBSCRIBER_INSTALLED.store(false, Ordering::SeqCst);
    }
    installed
}

fn install(config: &LogConfig, filter: EnvFilter) -> Result<(), LogError> {
    let base = tracing_subscriber::registry().with(filter);

    if let Some(path) = &config.log_file {
        let sink = Arc::new(std::fs::File::create(path)?);
        match config.format {
            LogFormat::Pretty => tracing::subscriber::set_global_default(
                base.with(fmt::layer().with_writer(sink).with_ansi(false)),
            )?,
            LogFormat::Json => tracing::subscriber::set_global_default(
                base.with(fmt::layer().json().with_writer(sink).with_ansi(false)),
            )?,
        }
        return Ok(());
    }

    match config.format {
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            base.with(fmt::layer().with_writer(io::stderr)),
        )?,
        LogFormat::Json => tracing::subscriber::set_global_default(
            base.with(fmt::layer().json().with_writer(io::stderr)),
        )?,
    }
    Ok(())
}
