//! Per-author detail extraction: one typed event row per detail bucket.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregation::{AggregationClient, AggregationError};
use crate::backend::{BucketKey, BucketSource, KeyValue, TermFilter};
use crate::ranges::{parse_bound, WindowPlan};
use crate::roster::AuthorRoster;
use crate::store::{RecordStore, StoreError};

pub const DETAIL_AGGREGATION: &str = "commits";
pub const ENTITY_FILTER_FIELD: &str = "author_uuid.keyword";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "git__hash")]
    pub hash: String,
    #[serde(rename = "git__lines_added")]
    pub lines_added: i64,
    #[serde(rename = "git__lines_removed")]
    pub lines_removed: i64,
    #[serde(rename = "git__files")]
    pub files: i64,
    #[serde(rename = "git__utc_commit")]
    pub utc_commit: DateTime<Utc>,
    #[serde(rename = "git__grimoire_creation_date")]
    pub grimoire_creation_date: DateTime<Utc>,
    #[serde(rename = "git__commit_date_weekday")]
    pub commit_date_weekday: u8,
    #[serde(rename = "git__commit_name")]
    pub commit_name: Option<String>,
    #[serde(rename = "git__commit_uuid")]
    pub commit_uuid: Option<String>,
    #[serde(rename = "git__message")]
    pub message: Option<String>,
    #[serde(rename = "git__time_to_commit_hours")]
    pub time_to_commit_hours: Option<f64>,
    #[serde(rename = "git__repo_name")]
    pub repo_name: String,
    pub author_uuid: String,
    pub author_bot: bool,
    pub author_name: Option<String>,
    pub author_date: DateTime<Utc>,
}

/// Composite sources for the detail query, in key order.
pub fn detail_sources() -> Vec<BucketSource> {
    vec![
        BucketSource::required("author_uuid", "author_uuid.keyword"),
        BucketSource::required("hash", "hash.keyword"),
        BucketSource::required("files", "files"),
        BucketSource::required("lines_added", "lines_added"),
        BucketSource::required("lines_removed", "lines_removed"),
        BucketSource::required("utc_commit", "utc_commit"),
        BucketSource::required("grimoire_creation_date", "grimoire_creation_date"),
        BucketSource::required("commit_date_weekday", "commit_date_weekday"),
        BucketSource::optional("message", "message.keyword"),
        BucketSource::optional("commit_name", "Commit_name.keyword"),
        BucketSource::optional("commit_uuid", "Commit_uuid.keyword"),
        BucketSource::required("repo_name", "repo_name.keyword"),
        BucketSource::optional("author_name", "author_name.keyword"),
        BucketSource::required("author_bot", "author_bot"),
        BucketSource::required("author_date", "author_date"),
        BucketSource::optional("time_to_commit_hours", "time_to_commit_hours"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bucket field '{field}' is missing or malformed")]
pub struct MalformedBucket {
    pub field: &'static str,
}

impl EventRecord {
    /// Flattens one detail bucket key. Optional fields that are absent, null or empty become `None`.
    pub fn from_bucket_key(key: &BucketKey) -> Result<Self, MalformedBucket> {
        let weekday = required(key, "commit_date_weekday", KeyValue::as_i64)?;
        if !(1..=7).contains(&weekday) {
            return Err(MalformedBucket {
                field: "commit_date_weekday",
            });
        }

        Ok(Self {
            hash: required_text(key, "hash")?,
            lines_added: required(key, "lines_added", KeyValue::as_i64)?,
            lines_removed: required(key, "lines_removed", KeyValue::as_i64)?,
            files: required(key, "files", KeyValue::as_i64)?,
            utc_commit: required(key, "utc_commit", key_datetime)?,
            grimoire_creation_date: required(key, "grimoire_creation_date", key_datetime)?,
            commit_date_weekday: weekday as u8,
            commit_name: optional_text(key, "commit_name"),
            commit_uuid: optional_text(key, "commit_uuid"),
            message: optional_text(key, "message"),
            time_to_commit_hours: key.get("time_to_commit_hours").and_then(KeyValue::as_f64),
            repo_name: required_text(key, "repo_name")?,
            author_uuid: required_text(key, "author_uuid")?,
            author_bot: required(key, "author_bot", KeyValue::as_bool)?,
            author_name: optional_text(key, "author_name"),
            author_date: required(key, "author_date", key_datetime)?,
        })
    }
}

fn required<T>(
    key: &BucketKey,
    field: &'static str,
    convert: impl Fn(&KeyValue) -> Option<T>,
) -> Result<T, MalformedBucket> {
    key.get(field)
        .and_then(convert)
        .ok_or(MalformedBucket { field })
}

fn required_text(key: &BucketKey, field: &'static str) -> Result<String, MalformedBucket> {
    required(key, field, key_text)
}

fn optional_text(key: &BucketKey, field: &str) -> Option<String> {
    key.get(field).and_then(key_text).filter(|text| !text.is_empty())
}

fn key_text(value: &KeyValue) -> Option<String> {
    match value {
        KeyValue::Str(text) => Some(text.clone()),
        KeyValue::Int(n) => Some(n.to_string()),
        KeyValue::Float(f) => Some(f.to_string()),
        KeyValue::Bool(_) | KeyValue::Null => None,
    }
}

/// Date terms key as epoch milliseconds; string keys are parsed as date bounds.
fn key_datetime(value: &KeyValue) -> Option<DateTime<Utc>> {
    match value {
        KeyValue::Int(ms) => Utc.timestamp_millis_opt(*ms).single(),
        KeyValue::Str(text) => parse_bound(text).ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Keep every row the backend returns, counting repeated hashes.
    #[default]
    KeepAll,
    /// Keep only the first row per hash.
    DropByHash,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "keep_all" | "keep" => Ok(Self::KeepAll),
            "drop_by_hash" | "drop" => Ok(Self::DropByHash),
            other => Err(format!("unknown duplicate policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractConfig {
    pub index: String,
    pub page_size: usize,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            index: "git".to_string(),
            page_size: 10_000,
            duplicate_policy: DuplicatePolicy::KeepAll,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub records: Vec<EventRecord>,
    pub malformed_buckets: u64,
    pub duplicate_hashes: u64,
    pub dropped_duplicates: u64,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("detail query failed for {entity_id} in window {start} - {end}: {source}")]
    Query {
        entity_id: String,
        start: String,
        end: String,
        #[source]
        source: AggregationError,
    },
    #[error("failed to persist records for {entity_id}: {source}")]
    Persist {
        entity_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntity {
    pub entity_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub entities_total: u64,
    pub entities_extracted: u64,
    pub records_written: u64,
    pub malformed_buckets: u64,
    pub duplicate_hashes: u64,
    pub dropped_duplicates: u64,
    pub failed: Vec<FailedEntity>,
}

pub struct RecordExtractor<'a> {
    client: AggregationClient<'a>,
    cfg: ExtractConfig,
    sources: Vec<BucketSource>,
}

impl<'a> RecordExtractor<'a> {
    pub fn new(client: AggregationClient<'a>, cfg: ExtractConfig) -> Self {
        Self {
            client,
            cfg,
            sources: detail_sources(),
        }
    }

    /// Queries every window oldest-first and concatenates the rows in window order.
    pub fn extract(&self, entity_id: &str, plan: &WindowPlan) -> Result<Extraction, ExtractError> {
        let filters = [TermFilter::new(ENTITY_FILTER_FIELD, entity_id)];
        let mut out = Extraction::default();
        let mut seen_hashes = HashSet::new();

        for range in plan.oldest_first() {
            let buckets = self
                .client
                .query(
                    DETAIL_AGGREGATION,
                    &self.cfg.index,
                    range,
                    &filters,
                    &self.sources,
                    self.cfg.page_size,
                )
                .map_err(|source| ExtractError::Query {
                    entity_id: entity_id.to_string(),
                    start: range.start.to_rfc3339(),
                    end: range.end.to_rfc3339(),
                    source,
                })?;

            debug!(
                component = "extract",
                event = "extract.window.finish",
                entity_id,
                start = %range.start,
                end = %range.end,
                bucket_count = buckets.len()
            );

            for bucket in &buckets {
                let record = match EventRecord::from_bucket_key(&bucket.key) {
                    Ok(record) => record,
                    Err(err) => {
                        out.malformed_buckets += 1;
                        warn!(
                            component = "extract",
                            event = "extract.bucket.malformed",
                            entity_id,
                            field = err.field
                        );
                        continue;
                    }
                };

                if !seen_hashes.insert(record.hash.clone()) {
                    out.duplicate_hashes += 1;
                    if self.cfg.duplicate_policy == DuplicatePolicy::DropByHash {
                        out.dropped_duplicates += 1;
                        continue;
                    }
                }
                out.records.push(record);
            }
        }

        if out.duplicate_hashes > 0 {
            warn!(
                component = "extract",
                event = "extract.entity.duplicate_hashes",
                entity_id,
                duplicate_hashes = out.duplicate_hashes,
                policy = ?self.cfg.duplicate_policy
            );
        }

        Ok(out)
    }

    /// Replaces whatever the store holds for `entity_id` with `records`.
    pub fn persist(
        &self,
        store: &dyn RecordStore,
        entity_id: &str,
        records: &[EventRecord],
    ) -> Result<(), ExtractError> {
        store
            .write(entity_id, records)
            .map_err(|source| ExtractError::Persist {
                entity_id: entity_id.to_string(),
                source,
            })
    }

    /// Extracts and persists every roster entity; a failing entity is reported and skipped.
    pub fn extract_all(
        &self,
        store: &dyn RecordStore,
        roster: &AuthorRoster,
        plan: &WindowPlan,
    ) -> ExtractionReport {
        let mut report = ExtractionReport {
            entities_total: roster.len() as u64,
            ..ExtractionReport::default()
        };

        for (position, entity_id) in roster.entity_ids().enumerate() {
            info!(
                component = "extract",
                event = "extract.entity.start",
                entity_id,
                position = position + 1,
                total = report.entities_total
            );

            let outcome = self.extract(entity_id, plan).and_then(|extraction| {
                self.persist(store, entity_id, &extraction.records)?;
                Ok(extraction)
            });

            match outcome {
                Ok(extraction) => {
                    report.entities_extracted += 1;
                    report.records_written += extraction.records.len() as u64;
                    report.malformed_buckets += extraction.malformed_buckets;
                    report.duplicate_hashes += extraction.duplicate_hashes;
                    report.dropped_duplicates += extraction.dropped_duplicates;
                    info!(
                        component = "extract",
                        event = "extract.entity.persisted",
                        entity_id,
                        record_count = extraction.records.len()
                    );
                }
                Err(err) => {
                    warn!(
                        component = "extract",
                        event = "extract.entity.failed",
                        entity_id,
                        error = %err
                    );
                    // A unit from an earlier run must not outlive a failed extraction.
                    match store.remove(entity_id) {
                        Ok(true) => info!(
                            component = "extract",
                            event = "extract.entity.stale_removed",
                            entity_id
                        ),
                        Ok(false) => {}
                        Err(remove_err) => warn!(
                            component = "extract",
                            event = "extract.entity.stale_remove_failed",
                            entity_id,
                            error = %remove_err
                        ),
                    }
                    report.failed.push(FailedEntity {
                        entity_id: entity_id.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            component = "extract",
            event = "extract.run.finish",
            entities_total = report.entities_total,
            entities_extracted = report.entities_extracted,
            entities_failed = report.failed.len(),
            records_written = report.records_written,
            malformed_buckets = report.malformed_buckets,
            duplicate_hashes = report.duplicate_hashes
        );

        report
    }
}
