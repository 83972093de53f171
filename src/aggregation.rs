//! Paginated composite aggregation over one date window.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{
    BackendError, BucketKey, BucketSource, CompositeSpec, SearchBackend, SearchRequest, TermFilter,
};
use crate::ranges::DateRange;

pub const DEFAULT_DATE_FIELD: &str = "grimoire_creation_date";
pub const DEFAULT_DISTINCT_FIELD: &str = "hash.keyword";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketCount {
    pub key: BucketKey,
    pub doc_count: u64,
    pub distinct_count: Option<u64>,
}

impl BucketCount {
    fn absorb(&mut self, other: &BucketCount) {
        self.doc_count = self.doc_count.saturating_add(other.doc_count);
        self.distinct_count = match (self.distinct_count, other.distinct_count) {
            (Some(a), Some(b)) => Some(a.saturating_add(b)),
            (a, b) => a.or(b),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    pub date_field: String,
    pub distinct_field: Option<String>,
    /// Hard ceiling on pages fetched for one query.
    pub max_pages: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            date_field: DEFAULT_DATE_FIELD.to_string(),
            distinct_field: Some(DEFAULT_DISTINCT_FIELD.to_string()),
            max_pages: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("invalid aggregation query: {0}")]
    InvalidQuery(String),
    #[error("backend query failed: {0}")]
    Backend(#[from] BackendError),
    #[error("aggregation '{name}' exceeded {max_pages} pages")]
    PageLimit { name: String, max_pages: usize },
    #[error("aggregation '{name}' cursor did not advance")]
    StalledCursor { name: String },
}

pub struct AggregationClient<'a> {
    backend: &'a dyn SearchBackend,
    cfg: AggregationConfig,
}

impl<'a> AggregationClient<'a> {
    pub fn new(backend: &'a dyn SearchBackend, cfg: AggregationConfig) -> Self {
        Self { backend, cfg }
    }

    /// Runs `name` over `range`, following `after_key` until the backend is exhausted.
    ///
    /// Buckets sharing a key across pages are merged by sum; first-seen order is kept.
    pub fn query(
        &self,
        name: &str,
        index: &str,
        range: &DateRange,
        filters: &[TermFilter],
        bucket_fields: &[BucketSource],
        page_size: usize,
    ) -> Result<Vec<BucketCount>, AggregationError> {
        if page_size == 0 {
            return Err(AggregationError::InvalidQuery(
                "page_size must be >= 1".to_string(),
            ));
        }
        if bucket_fields.is_empty() {
            return Err(AggregationError::InvalidQuery(
                "at least one bucket field is required".to_string(),
            ));
        }

        let mut request = SearchRequest {
            index: index.to_string(),
            date_field: self.cfg.date_field.clone(),
            range: *range,
            terms: filters.to_vec(),
            aggregation: CompositeSpec {
                name: name.to_string(),
                sources: bucket_fields.to_vec(),
                size: page_size,
                after: None,
                cardinality_field: self.cfg.distinct_field.clone(),
            },
        };

        let mut pages = Vec::new();
        let mut total_hits = 0u64;
        loop {
            if pages.len() >= self.cfg.max_pages {
                return Err(AggregationError::PageLimit {
                    name: name.to_string(),
                    max_pages: self.cfg.max_pages,
                });
            }

            let response = self.backend.search(&request)?;
            total_hits = total_hits.max(response.total_hits);
            let page_len = response.buckets.len();
            debug!(
                component = "aggregation",
                event = "aggregation.query.page",
                aggregation = name,
                page = pages.len(),
                bucket_count = page_len,
                has_after_key = response.after_key.is_some()
            );

            pages.push(
                response
                    .buckets
                    .into_iter()
                    .map(|bucket| BucketCount {
                        key: bucket.key,
                        doc_count: bucket.doc_count,
                        distinct_count: bucket.distinct_count,
                    })
                    .collect::<Vec<_>>(),
            );

            let Some(after_key) = response.after_key else {
                break;
            };
            if page_len < page_size {
                break;
            }
            if request.aggregation.after.as_ref() == Some(&after_key) {
                return Err(AggregationError::StalledCursor {
                    name: name.to_string(),
                });
            }
            request.aggregation.after = Some(after_key);
        }

        let page_count = pages.len();
        let merged = merge_bucket_counts(pages.into_iter().flatten());

        info!(
            component = "aggregation",
            event = "aggregation.query.finish",
            aggregation = name,
            index,
            start = %range.start,
            end = %range.end,
            filter_count = filters.len(),
            pages = page_count,
            bucket_count = merged.len(),
            total_hits
        );

        Ok(merged)
    }
}

/// Sums counts of buckets with equal keys, keeping first-seen key order.
pub fn merge_bucket_counts(buckets: impl IntoIterator<Item = BucketCount>) -> Vec<BucketCount> {
    let mut index: HashMap<BucketKey, usize> = HashMap::new();
    let mut merged: Vec<BucketCount> = Vec::new();

    for bucket in buckets {
        match index.get(&bucket.key) {
            Some(&slot) => merged[slot].absorb(&bucket),
            None => {
                index.insert(bucket.key.clone(), merged.len());
                merged.push(bucket);
            }
        }
    }

    merged
}
