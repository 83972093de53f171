//! End-to-end run: partition, roster, extract, persist, reduce, export.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregation::{AggregationClient, AggregationConfig};
use crate::backend::{BackendError, SearchBackend};
use crate::config::{ConfigError, PipelineConfig, StoreKind};
use crate::extract::{ExtractionReport, FailedEntity, RecordExtractor};
use crate::features::{
    assert_schema_compatible, build_feature_schema, read_schema_sidecar, write_schema_sidecar,
    FeatureError, ReduceReport,
};
use crate::ranges::{partition, RangeError, WindowPlan};
use crate::roster::{AuthorRoster, RosterError};
use crate::store::{JsonDirStore, RecordStore, SqliteRecordStore, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

/// Run-wide state threaded through the stages.
#[derive(Debug)]
pub struct RunContext {
    started: Instant,
    started_at: DateTime<Utc>,
    window_count: usize,
    roster_size: usize,
    roster_skipped_buckets: u64,
    extraction: Option<ExtractionReport>,
    reduction: Option<ReduceReport>,
    exported: Option<PathBuf>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            window_count: 0,
            roster_size: 0,
            roster_skipped_buckets: 0,
            extraction: None,
            reduction: None,
            exported: None,
        }
    }

    pub fn summary(&self) -> RunSummary {
        let extraction = self.extraction.clone().unwrap_or_default();
        let reduction = self.reduction.clone().unwrap_or_default();
        RunSummary {
            started_at: self.started_at,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            window_count: self.window_count,
            roster_size: self.roster_size,
            roster_skipped_buckets: self.roster_skipped_buckets,
            entities_extracted: extraction.entities_extracted,
            records_written: extraction.records_written,
            malformed_buckets: extraction.malformed_buckets,
            duplicate_hashes: extraction.duplicate_hashes,
            dropped_duplicates: extraction.dropped_duplicates,
            extraction_failed: extraction.failed,
            entities_loaded: reduction.loaded,
            empty_entities: reduction.empty_entities,
            below_threshold: reduction.below_threshold,
            rows_emitted: reduction.emitted,
            reduction_failed: reduction.failed,
            output_path: self.exported.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub window_count: usize,
    pub roster_size: usize,
    pub roster_skipped_buckets: u64,
    pub entities_extracted: u64,
    pub records_written: u64,
    pub malformed_buckets: u64,
    pub duplicate_hashes: u64,
    pub dropped_duplicates: u64,
    pub extraction_failed: Vec<FailedEntity>,
    pub entities_loaded: u64,
    pub empty_entities: u64,
    pub below_threshold: u64,
    pub rows_emitted: u64,
    pub reduction_failed: Vec<FailedEntity>,
    pub output_path: Option<PathBuf>,
}

impl RunSummary {
    pub fn failed_entity_count(&self) -> usize {
        self.extraction_failed.len() + self.reduction_failed.len()
    }
}

pub fn open_store(cfg: &PipelineConfig) -> Result<Box<dyn RecordStore>, StoreError> {
    let store: Box<dyn RecordStore> = match cfg.store_kind {
        StoreKind::JsonDir => Box::new(JsonDirStore::open(&cfg.data_dir)?),
        StoreKind::Sqlite => Box::new(SqliteRecordStore::open(&cfg.sqlite_path())?),
    };
    Ok(store)
}

pub fn window_plan(cfg: &PipelineConfig) -> Result<WindowPlan, RangeError> {
    partition(cfg.date_start, cfg.date_end, cfg.window_span)
}

/// Builds the roster and extracts every entity into `store`.
///
/// Roster failures abort; per-entity failures land in the returned report.
pub fn run_extraction(
    ctx: &mut RunContext,
    cfg: &PipelineConfig,
    backend: &dyn SearchBackend,
    store: &dyn RecordStore,
) -> Result<ExtractionReport, PipelineError> {
    cfg.validate()?;
    let plan = window_plan(cfg)?;
    ctx.window_count = plan.len();

    let aggregation_cfg = AggregationConfig {
        max_pages: cfg.max_pages,
        ..AggregationConfig::default()
    };
    let roster = AuthorRoster::build(
        &AggregationClient::new(backend, aggregation_cfg.clone()),
        &cfg.index_name,
        &plan,
        cfg.page_size,
    )?;
    ctx.roster_size = roster.len();
    ctx.roster_skipped_buckets = roster.skipped_buckets();

    if let Some(path) = &cfg.roster_export_path {
        roster.write_csv(path)?;
    }

    let extractor = RecordExtractor::new(
        AggregationClient::new(backend, aggregation_cfg),
        cfg.extract_config(),
    );
    let report = extractor.extract_all(store, &roster, &plan);
    if !report.failed.is_empty() {
        warn!(
            component = "pipeline",
            event = "pipeline.extraction.partial",
            failed = report.failed.len(),
            entities_total = report.entities_total
        );
    }
    ctx.extraction = Some(report.clone());
    Ok(report)
}

/// Reduces `store` into the feature table and writes it when export is enabled.
///
/// An existing table whose sidecar describes a different schema is never overwritten.
pub fn run_reduction(
    ctx: &mut RunContext,
    cfg: &PipelineConfig,
    store: &dyn RecordStore,
) -> Result<ReduceReport, PipelineError> {
    let schema = build_feature_schema();
    if cfg.export_enabled {
        if let Some(existing) = read_schema_sidecar(&cfg.output_path)? {
            assert_schema_compatible(existing.version, &existing.fingerprint, &schema)?;
        }
    }

    let (table, report) = cfg.feature_reducer().reduce(store)?;

    if cfg.export_enabled {
        table.write(&cfg.output_path, cfg.output_format)?;
        let schema_path = write_schema_sidecar(&cfg.output_path, &schema)?;
        info!(
            component = "pipeline",
            event = "pipeline.export.finish",
            output_path = %cfg.output_path.display(),
            schema_path = %schema_path.display(),
            row_count = table.len()
        );
        ctx.exported = Some(cfg.output_path.clone());
    }

    ctx.reduction = Some(report.clone());
    Ok(report)
}

pub fn run_pipeline(
    cfg: &PipelineConfig,
    backend: &dyn SearchBackend,
    store: &dyn RecordStore,
) -> Result<RunSummary, PipelineError> {
    let mut ctx = RunContext::new();
    run_extraction(&mut ctx, cfg, backend, store)?;
    run_reduction(&mut ctx, cfg, store)?;

    let summary = ctx.summary();
    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        elapsed_ms = summary.elapsed_ms,
        window_count = summary.window_count,
        roster_size = summary.roster_size,
        roster_skipped_buckets = summary.roster_skipped_buckets,
        records_written = summary.records_written,
        rows_emitted = summary.rows_emitted,
        failed_entities = summary.failed_entity_count()
    );
    Ok(summary)
}
