//! Logging setup shared by the binaries.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{parse_bool, PipelineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `revelio=debug,reqwest=warn`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

/// Unparsable format or target values keep their defaults; logging never blocks startup.
pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = lookup("REVELIO_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }
    if let Some(format) = lookup("REVELIO_LOG_FORMAT").and_then(|raw| raw.parse().ok()) {
        config.format = format;
    }
    if let Some(include_target) = lookup("REVELIO_LOG_TARGET").and_then(|raw| parse_bool(&raw).ok())
    {
        config.include_target = include_target;
    }

    config
}

/// Installs the global subscriber. Events go to stderr so stdout stays free for run summaries.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_run_config(component: &'static str, cfg: &PipelineConfig) {
    info!(
        component,
        event = "app.config",
        index = %cfg.index_name,
        date_start = %cfg.date_start,
        date_end = %cfg.date_end,
        window_span = %cfg.window_span,
        page_size = cfg.page_size,
        max_pages = cfg.max_pages,
        activity_threshold = cfg.activity_threshold,
        backend_url = %cfg.backend.base_url,
        store_kind = ?cfg.store_kind,
        data_dir = %cfg.data_dir.display(),
        export_enabled = cfg.export_enabled,
        output_path = %cfg.output_path.display(),
        duplicate_policy = ?cfg.duplicate_policy
    );
}
