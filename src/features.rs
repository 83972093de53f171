//! Per-author statistical reduction of persisted event rows into classifier input.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::extract::{EventRecord, FailedEntity};
use crate::store::{RecordStore, StoreError};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_ACTIVITY_THRESHOLD: u64 = 10;
pub const DEFAULT_SIGN_OFF_MARKER: &str = "Signed-off-by:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    U64,
    F64,
    Str,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

const COLUMNS: [(&str, FeatureDType); 21] = [
    ("git__num_merge_commits", FeatureDType::U64),
    ("git__num_weekend_commits", FeatureDType::U64),
    ("git__num_signed_commits", FeatureDType::U64),
    ("git__num_commits", FeatureDType::U64),
    ("git__num_repos", FeatureDType::U64),
    ("git__ratio_merge_commits", FeatureDType::F64),
    ("git__ratio_weekend_commits", FeatureDType::F64),
    ("git__ratio_signed_commits", FeatureDType::F64),
    ("git__median_files", FeatureDType::F64),
    ("git__iqr_files", FeatureDType::F64),
    ("git__median_lines_added", FeatureDType::F64),
    ("git__iqr_lines_added", FeatureDType::F64),
    ("git__median_lines_removed", FeatureDType::F64),
    ("git__iqr_lines_removed", FeatureDType::F64),
    ("git__median_len_commit_message", FeatureDType::F64),
    ("git__iqr_len_commit_message", FeatureDType::F64),
    ("git__median_len_words_commit_message", FeatureDType::F64),
    ("git__iqr_len_words_commit_message", FeatureDType::F64),
    ("author_uuid", FeatureDType::Str),
    ("author_name", FeatureDType::Str),
    ("author_bot", FeatureDType::Bool),
];

/// Field order matches [`build_feature_schema`]; CSV headers follow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    #[serde(rename = "git__num_merge_commits")]
    pub num_merge_commits: u64,
    #[serde(rename = "git__num_weekend_commits")]
    pub num_weekend_commits: u64,
    #[serde(rename = "git__num_signed_commits")]
    pub num_signed_commits: u64,
    #[serde(rename = "git__num_commits")]
    pub num_commits: u64,
    #[serde(rename = "git__num_repos")]
    pub num_repos: u64,
    #[serde(rename = "git__ratio_merge_commits")]
    pub ratio_merge_commits: f64,
    #[serde(rename = "git__ratio_weekend_commits")]
    pub ratio_weekend_commits: f64,
    #[serde(rename = "git__ratio_signed_commits")]
    pub ratio_signed_commits: f64,
    #[serde(rename = "git__median_files")]
    pub median_files: f64,
    #[serde(rename = "git__iqr_files")]
    pub iqr_files: f64,
    #[serde(rename = "git__median_lines_added")]
    pub median_lines_added: f64,
    #[serde(rename = "git__iqr_lines_added")]
    pub iqr_lines_added: f64,
    #[serde(rename = "git__median_lines_removed")]
    pub median_lines_removed: f64,
    #[serde(rename = "git__iqr_lines_removed")]
    pub iqr_lines_removed: f64,
    #[serde(rename = "git__median_len_commit_message")]
    pub median_len_commit_message: f64,
    #[serde(rename = "git__iqr_len_commit_message")]
    pub iqr_len_commit_message: f64,
    #[serde(rename = "git__median_len_words_commit_message")]
    pub median_len_words_commit_message: f64,
    #[serde(rename = "git__iqr_len_words_commit_message")]
    pub iqr_len_words_commit_message: f64,
    pub author_uuid: String,
    pub author_name: Option<String>,
    pub author_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    JsonLines,
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" | "jsonl" | "json_lines" => Ok(Self::JsonLines),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown output format '{other}'")),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceReport {
    pub loaded: u64,
    pub empty_entities: u64,
    pub below_threshold: u64,
    pub emitted: u64,
    pub failed: Vec<FailedEntity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureReducer {
    /// Entities with fewer distinct hashes are left out of the table.
    pub activity_threshold: u64,
    pub sign_off_marker: String,
}

impl Default for FeatureReducer {
    fn default() -> Self {
        Self {
            activity_threshold: DEFAULT_ACTIVITY_THRESHOLD,
            sign_off_marker: DEFAULT_SIGN_OFF_MARKER.to_string(),
        }
    }
}

struct DerivedRow<'a> {
    record: &'a EventRecord,
    is_merge: bool,
    is_weekend: bool,
    is_signed: bool,
    message_char_len: f64,
    message_word_count: f64,
}

impl FeatureReducer {
    pub fn new(activity_threshold: u64, sign_off_marker: impl Into<String>) -> Self {
        Self {
            activity_threshold,
            sign_off_marker: sign_off_marker.into(),
        }
    }

    /// Reduces every stored entity in key order. Unreadable entities are reported, not fatal.
    pub fn reduce(
        &self,
        store: &dyn RecordStore,
    ) -> Result<(FeatureTable, ReduceReport), FeatureError> {
        let keys = store.list_keys()?;
        let mut rows = Vec::new();
        let mut report = ReduceReport::default();

        for entity_id in &keys {
            let records = match store.read(entity_id) {
                Ok(records) => records,
                Err(err) => {
                    warn!(
                        component = "features",
                        event = "features.entity.load_failed",
                        entity_id = entity_id.as_str(),
                        error = %err
                    );
                    report.failed.push(FailedEntity {
                        entity_id: entity_id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            report.loaded += 1;

            if records.is_empty() {
                report.empty_entities += 1;
                info!(
                    component = "features",
                    event = "features.entity.empty",
                    entity_id = entity_id.as_str()
                );
                continue;
            }

            let distinct = distinct_hash_count(&records);
            if distinct < self.activity_threshold {
                report.below_threshold += 1;
                debug!(
                    component = "features",
                    event = "features.entity.below_threshold",
                    entity_id = entity_id.as_str(),
                    distinct_hashes = distinct,
                    threshold = self.activity_threshold
                );
                continue;
            }

            if let Some(row) = self.reduce_entity(&records) {
                rows.push(row);
                report.emitted += 1;
            }
        }

        info!(
            component = "features",
            event = "features.reduce.finish",
            entities = keys.len(),
            loaded = report.loaded,
            empty_entities = report.empty_entities,
            below_threshold = report.below_threshold,
            failed = report.failed.len(),
            emitted = report.emitted
        );

        Ok((FeatureTable { rows }, report))
    }

    /// One feature vector over `records` with repeated hashes collapsed to their first row.
    ///
    /// Identity columns come from the first record. `None` for an empty slice.
    pub fn reduce_entity(&self, records: &[EventRecord]) -> Option<FeatureRow> {
        let first = records.first()?;

        let mut seen = HashSet::new();
        let rows: Vec<DerivedRow<'_>> = records
            .iter()
            .filter(|record| seen.insert(record.hash.as_str()))
            .map(|record| self.derive(record))
            .collect();

        let num_commits = rows.len() as u64;
        let num_merge_commits = rows.iter().filter(|row| row.is_merge).count() as u64;
        let num_weekend_commits = rows.iter().filter(|row| row.is_weekend).count() as u64;
        let num_signed_commits = rows.iter().filter(|row| row.is_signed).count() as u64;
        let num_repos = rows
            .iter()
            .map(|row| row.record.repo_name.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;

        let files: Vec<f64> = rows.iter().map(|row| row.record.files as f64).collect();
        let lines_added: Vec<f64> = rows.iter().map(|row| row.record.lines_added as f64).collect();
        let lines_removed: Vec<f64> = rows
            .iter()
            .map(|row| row.record.lines_removed as f64)
            .collect();
        let message_len: Vec<f64> = rows.iter().map(|row| row.message_char_len).collect();
        let message_words: Vec<f64> = rows.iter().map(|row| row.message_word_count).collect();

        Some(FeatureRow {
            num_merge_commits,
            num_weekend_commits,
            num_signed_commits,
            num_commits,
            num_repos,
            ratio_merge_commits: ratio(num_merge_commits, num_commits),
            ratio_weekend_commits: ratio(num_weekend_commits, num_commits),
            ratio_signed_commits: ratio(num_signed_commits, num_commits),
            median_files: median(&files).unwrap_or(0.0),
            iqr_files: iqr(&files).unwrap_or(0.0),
            median_lines_added: median(&lines_added).unwrap_or(0.0),
            iqr_lines_added: iqr(&lines_added).unwrap_or(0.0),
            median_lines_removed: median(&lines_removed).unwrap_or(0.0),
            iqr_lines_removed: iqr(&lines_removed).unwrap_or(0.0),
            median_len_commit_message: median(&message_len).unwrap_or(0.0),
            iqr_len_commit_message: iqr(&message_len).unwrap_or(0.0),
            median_len_words_commit_message: median(&message_words).unwrap_or(0.0),
            iqr_len_words_commit_message: iqr(&message_words).unwrap_or(0.0),
            author_uuid: first.author_uuid.clone(),
            author_name: first.author_name.clone(),
            author_bot: first.author_bot,
        })
    }

    fn derive<'a>(&self, record: &'a EventRecord) -> DerivedRow<'a> {
        // No message measures as empty: 0 chars, 0 words, never signed.
        let message = record.message.as_deref().unwrap_or("");
        DerivedRow {
            record,
            is_merge: record.files == 0,
            is_weekend: record.commit_date_weekday >= 6,
            is_signed: !self.sign_off_marker.is_empty() && message.contains(&self.sign_off_marker),
            message_char_len: message.chars().count() as f64,
            message_word_count: message.split_whitespace().count() as f64,
        }
    }
}

fn distinct_hash_count(records: &[EventRecord]) -> u64 {
    records
        .iter()
        .map(|record| record.hash.as_str())
        .collect::<HashSet<_>>()
        .len() as u64
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Linear interpolation between closest ranks at position `q * (n - 1)`.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

/// Interquartile range, q(0.75) - q(0.25).
pub fn iqr(values: &[f64]) -> Option<f64> {
    Some(quantile(values, 0.75)? - quantile(values, 0.25)?)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write(&self, path: &Path, format: OutputFormat) -> Result<(), FeatureError> {
        match format {
            OutputFormat::JsonLines => self.write_json_lines(path),
            OutputFormat::Csv => self.write_csv(path),
        }
    }

    /// One JSON object per line, in entity key order.
    pub fn write_json_lines(&self, path: &Path) -> Result<(), FeatureError> {
        ensure_parent(path)?;
        let mut out = Vec::new();
        for row in &self.rows {
            serde_json::to_writer(&mut out, row)?;
            out.push(b'\n');
        }
        fs::write(path, out)?;
        self.log_export(path, OutputFormat::JsonLines);
        Ok(())
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), FeatureError> {
        ensure_parent(path)?;
        let mut writer = csv::Writer::from_path(path)?;
        if self.rows.is_empty() {
            writer.write_record(COLUMNS.iter().map(|(name, _)| *name))?;
        }
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        self.log_export(path, OutputFormat::Csv);
        Ok(())
    }

    fn log_export(&self, path: &Path, format: OutputFormat) {
        info!(
            component = "features",
            event = "features.export.finish",
            path = %path.display(),
            format = ?format,
            row_count = self.rows.len()
        );
    }
}

fn ensure_parent(path: &Path) -> Result<(), FeatureError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn build_feature_schema() -> FeatureSchema {
    let columns: Vec<FeatureColumn> = COLUMNS
        .iter()
        .map(|(name, dtype)| FeatureColumn {
            name: (*name).to_string(),
            dtype: *dtype,
        })
        .collect();
    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, &columns);

    debug!(
        component = "features",
        event = "features.schema.built",
        version = FEATURE_SCHEMA_VERSION,
        column_count = columns.len(),
        fingerprint = fingerprint.as_str()
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

/// `<output>.schema.json` next to the exported table.
pub fn schema_sidecar_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".schema.json");
    output.with_file_name(name)
}

pub fn write_schema_sidecar(output: &Path, schema: &FeatureSchema) -> Result<PathBuf, FeatureError> {
    let path = schema_sidecar_path(output);
    ensure_parent(&path)?;
    let mut bytes = serde_json::to_vec_pretty(schema)?;
    bytes.push(b'\n');
    fs::write(&path, bytes)?;
    Ok(path)
}

/// The sidecar already next to `output`, if any.
pub fn read_schema_sidecar(output: &Path) -> Result<Option<FeatureSchema>, FeatureError> {
    let path = schema_sidecar_path(output);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(version: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{:?};", column.dtype).to_ascii_lowercase());
    }
    hex::encode(hasher.finalize())
}
