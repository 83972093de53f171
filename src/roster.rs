//! Distinct author set across all windows, with merged activity counts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregation::{AggregationClient, AggregationError, BucketCount};
use crate::backend::{BucketSource, KeyValue};
use crate::ranges::WindowPlan;

pub const ROSTER_AGGREGATION: &str = "by_author";
pub const ENTITY_KEY: &str = "by_author_uuid";
pub const BOT_KEY: &str = "by_author_bot";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(rename = "author_uuid")]
    pub entity_id: String,
    #[serde(rename = "author_bot")]
    pub is_bot: bool,
    #[serde(rename = "doc_count")]
    pub activity_count: u64,
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("roster query failed for window {start} - {end}: {source}")]
    Query {
        start: String,
        end: String,
        #[source]
        source: AggregationError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub fn roster_sources() -> Vec<BucketSource> {
    vec![
        BucketSource::required(ENTITY_KEY, "author_uuid.keyword"),
        BucketSource::required(BOT_KEY, "author_bot"),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorRoster {
    entries: BTreeMap<String, EntityRecord>,
    skipped_buckets: u64,
}

impl AuthorRoster {
    pub fn build(
        client: &AggregationClient<'_>,
        index: &str,
        plan: &WindowPlan,
        page_size: usize,
    ) -> Result<Self, RosterError> {
        let sources = roster_sources();
        let mut roster = Self::default();

        for range in plan.oldest_first() {
            let buckets = client
                .query(ROSTER_AGGREGATION, index, range, &[], &sources, page_size)
                .map_err(|source| RosterError::Query {
                    start: range.start.to_rfc3339(),
                    end: range.end.to_rfc3339(),
                    source,
                })?;
            for bucket in &buckets {
                roster.merge_bucket(bucket);
            }
        }

        if roster.skipped_buckets > 0 {
            warn!(
                component = "roster",
                event = "roster.build.skipped_buckets",
                skipped_buckets = roster.skipped_buckets
            );
        }
        info!(
            component = "roster",
            event = "roster.build.finish",
            index,
            window_count = plan.len(),
            entity_count = roster.len(),
            bot_count = roster.iter().filter(|entry| entry.is_bot).count()
        );

        Ok(roster)
    }

    /// Adds a bucket's count to its entity; the bot flag is taken from the first bucket seen.
    pub fn merge_bucket(&mut self, bucket: &BucketCount) {
        let Some(entity_id) = bucket.key.get(ENTITY_KEY).and_then(entity_id_text) else {
            self.skipped_buckets += 1;
            return;
        };
        let is_bot = bucket
            .key
            .get(BOT_KEY)
            .and_then(|value| value.as_bool())
            .unwrap_or(false);

        let entry = self
            .entries
            .entry(entity_id.clone())
            .or_insert_with(|| EntityRecord {
                entity_id,
                is_bot,
                activity_count: 0,
            });
        entry.activity_count = entry.activity_count.saturating_add(bucket.doc_count);
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityRecord> {
        self.entries.get(entity_id)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn skipped_buckets(&self) -> u64 {
        self.skipped_buckets
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), RosterError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for entry in self.entries.values() {
            writer.serialize(entry)?;
        }
        writer.flush()?;

        info!(
            component = "roster",
            event = "roster.export.finish",
            path = %path.display(),
            entity_count = self.entries.len()
        );
        Ok(())
    }
}

fn entity_id_text(value: &KeyValue) -> Option<String> {
    match value {
        KeyValue::Str(id) if !id.is_empty() => Some(id.clone()),
        KeyValue::Int(id) => Some(id.to_string()),
        _ => None,
    }
}

impl FromIterator<EntityRecord> for AuthorRoster {
    fn from_iter<I: IntoIterator<Item = EntityRecord>>(iter: I) -> Self {
        let mut roster = Self::default();
        for record in iter {
            roster.entries.insert(record.entity_id.clone(), record);
        }
        roster
    }
}
