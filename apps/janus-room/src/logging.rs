use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Overrides the computed filter with a raw `EnvFilter` directive string.
const FILTER_VAR: &str = "JANUS_LOG_FILTER";
/// Lets WebRTC, HTTP and TLS crates log at the chosen level instead of `warn`.
const DEPS_VAR: &str = "JANUS_TRACE_DEPS";

/// Prefix match: covers the `janus::*` event targets as well as the
/// `janus_client` and `janus_room` module paths.
const OWN_TARGET: &str = "janus";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    AlreadyInstalled(#[from] SetGlobalDefaultError),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(FILTER_VAR) {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(filter_for(config.level, env_truthy(DEPS_VAR))),
    };
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn env_truthy(var: &str) -> bool {
    std::env::var(var)
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
}

/// Our own targets follow `level`; dependencies stay at `warn` or quieter
/// unless `verbose_deps` is set.
fn filter_for(level: LogLevel, verbose_deps: bool) -> String {
    let deps = if verbose_deps {
        level
    } else {
        level.min(LogLevel::Warn)
    };
    if deps == level {
        return level.directive().to_owned();
    }
    format!("{},{OWN_TARGET}={}", deps.directive(), level.directive())
}
