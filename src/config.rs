//! Run configuration, read from `REVELIO_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::backend::ElasticsearchConfig;
use crate::extract::{DuplicatePolicy, ExtractConfig};
use crate::features::{FeatureReducer, OutputFormat, DEFAULT_ACTIVITY_THRESHOLD, DEFAULT_SIGN_OFF_MARKER};
use crate::ranges::{parse_bound, WindowSpan};

// 2008-01-01T00:00:00Z and 2021-09-15T00:00:00Z.
const DEFAULT_DATE_START_SECS: i64 = 1_199_145_600;
const DEFAULT_DATE_END_SECS: i64 = 1_631_664_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    JsonDir,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" | "json_dir" | "jsondir" => Ok(Self::JsonDir),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub index_name: String,
    pub date_start: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
    pub window_span: WindowSpan,
    pub activity_threshold: u64,
    pub page_size: usize,
    /// Write the feature table; reduction still runs when false.
    pub export_enabled: bool,
    pub output_path: PathBuf,
    pub output_format: OutputFormat,
    pub backend: ElasticsearchConfig,
    pub max_pages: usize,
    pub data_dir: PathBuf,
    pub store_kind: StoreKind,
    pub roster_export_path: Option<PathBuf>,
    pub duplicate_policy: DuplicatePolicy,
    pub sign_off_marker: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            index_name: "git".to_string(),
            date_start: DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(DEFAULT_DATE_START_SECS),
            date_end: DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(DEFAULT_DATE_END_SECS),
            window_span: WindowSpan::THIRTY_DAYS,
            activity_threshold: DEFAULT_ACTIVITY_THRESHOLD,
            page_size: 10_000,
            export_enabled: true,
            output_path: PathBuf::from("datasets/df_git.json"),
            output_format: OutputFormat::JsonLines,
            backend: ElasticsearchConfig::default(),
            max_pages: 10_000,
            data_dir: PathBuf::from("data"),
            store_kind: StoreKind::JsonDir,
            roster_export_path: None,
            duplicate_policy: DuplicatePolicy::KeepAll,
            sign_off_marker: DEFAULT_SIGN_OFF_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index_name.trim().is_empty() {
            return Err(ConfigError::Invalid("index_name must not be empty".to_string()));
        }
        if self.date_start >= self.date_end {
            return Err(ConfigError::Invalid(format!(
                "date_start {} must be before date_end {}",
                self.date_start, self.date_end
            )));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be >= 1".to_string()));
        }
        if self.max_pages == 0 {
            return Err(ConfigError::Invalid("max_pages must be >= 1".to_string()));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("backend_url must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn extract_config(&self) -> ExtractConfig {
        ExtractConfig {
            index: self.index_name.clone(),
            page_size: self.page_size,
            duplicate_policy: self.duplicate_policy,
        }
    }

    pub fn feature_reducer(&self) -> FeatureReducer {
        FeatureReducer::new(self.activity_threshold, self.sign_off_marker.clone())
    }

    /// SQLite file used when `store_kind` is [`StoreKind::Sqlite`].
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("records.sqlite")
    }
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    pipeline_config_from_lookup(|key| env::var(key).ok())
}

/// Same as [`pipeline_config_from_env`] with an explicit variable source. Blank values are ignored.
pub fn pipeline_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PipelineConfig, ConfigError> {
    let get = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let mut cfg = PipelineConfig::default();

    if let Some(index) = get("REVELIO_INDEX") {
        cfg.index_name = index;
    }
    if let Some(raw) = get("REVELIO_DATE_START") {
        cfg.date_start = parse_var("REVELIO_DATE_START", &raw, parse_bound)?;
    }
    if let Some(raw) = get("REVELIO_DATE_END") {
        cfg.date_end = parse_var("REVELIO_DATE_END", &raw, parse_bound)?;
    }
    if let Some(raw) = get("REVELIO_WINDOW_SPAN") {
        cfg.window_span = parse_var("REVELIO_WINDOW_SPAN", &raw, str::parse)?;
    }
    if let Some(raw) = get("REVELIO_ACTIVITY_THRESHOLD") {
        cfg.activity_threshold = parse_var("REVELIO_ACTIVITY_THRESHOLD", &raw, str::parse)?;
    }
    if let Some(raw) = get("REVELIO_PAGE_SIZE") {
        cfg.page_size = parse_var("REVELIO_PAGE_SIZE", &raw, str::parse)?;
    }
    if let Some(raw) = get("REVELIO_EXPORT_ENABLED") {
        cfg.export_enabled = parse_var("REVELIO_EXPORT_ENABLED", &raw, parse_bool)?;
    }
    if let Some(raw) = get("REVELIO_OUTPUT_PATH") {
        cfg.output_path = PathBuf::from(raw);
    }
    if let Some(raw) = get("REVELIO_OUTPUT_FORMAT") {
        cfg.output_format = parse_var("REVELIO_OUTPUT_FORMAT", &raw, str::parse)?;
    }
    if let Some(url) = get("REVELIO_BACKEND_URL") {
        cfg.backend.base_url = url;
    }
    if let Some(raw) = get("REVELIO_BACKEND_TIMEOUT_MS") {
        cfg.backend.timeout_ms = parse_var("REVELIO_BACKEND_TIMEOUT_MS", &raw, str::parse)?;
    }
    cfg.backend.username = get("REVELIO_BACKEND_USERNAME");
    cfg.backend.password = get("REVELIO_BACKEND_PASSWORD");
    if let Some(raw) = get("REVELIO_BACKEND_INSECURE") {
        cfg.backend.accept_invalid_certs = parse_var("REVELIO_BACKEND_INSECURE", &raw, parse_bool)?;
    }
    if let Some(raw) = get("REVELIO_MAX_PAGES") {
        cfg.max_pages = parse_var("REVELIO_MAX_PAGES", &raw, str::parse)?;
    }
    if let Some(raw) = get("REVELIO_DATA_DIR") {
        cfg.data_dir = PathBuf::from(raw);
    }
    if let Some(raw) = get("REVELIO_STORE_KIND") {
        cfg.store_kind = parse_var("REVELIO_STORE_KIND", &raw, str::parse)?;
    }
    cfg.roster_export_path = get("REVELIO_ROSTER_EXPORT_PATH").map(PathBuf::from);
    if let Some(raw) = get("REVELIO_DUPLICATE_POLICY") {
        cfg.duplicate_policy = parse_var("REVELIO_DUPLICATE_POLICY", &raw, str::parse)?;
    }
    if let Some(marker) = lookup("REVELIO_SIGN_OFF_MARKER") {
        cfg.sign_off_marker = marker;
    }

    cfg.validate()?;
    Ok(cfg)
}

fn parse_var<T, E: ToString>(
    var: &'static str,
    raw: &str,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Result<T, ConfigError> {
    parse(raw).map_err(|err| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

pub(crate) fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}
