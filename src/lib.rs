//! Revelio core crate.
//!
//! Contributor activity extraction from a GrimoireLab git index and reduction
//! into per-author classifier features:
//! - date-window partitioning and paginated composite aggregation
//! - author roster and per-author event extraction into a record store
//! - per-author statistical features and table export

mod aggregation;
mod backend;
mod config;
mod extract;
mod features;
mod observability;
mod pipeline;
mod ranges;
mod roster;
mod store;

pub use aggregation::{
    merge_bucket_counts, AggregationClient, AggregationConfig, AggregationError, BucketCount,
    DEFAULT_DATE_FIELD, DEFAULT_DISTINCT_FIELD,
};
pub use backend::{
    build_search_body, parse_search_response, BackendError, Bucket, BucketKey, BucketSource,
    CompositeSpec, ElasticsearchBackend, ElasticsearchConfig, KeyValue, SearchBackend,
    SearchRequest, SearchResponse, TermFilter, CARDINALITY_AGG_NAME,
};
pub use config::{
    pipeline_config_from_env, pipeline_config_from_lookup, ConfigError, PipelineConfig, StoreKind,
};
pub use extract::{
    detail_sources, DuplicatePolicy, EventRecord, ExtractConfig, ExtractError, Extraction,
    ExtractionReport, FailedEntity, MalformedBucket, RecordExtractor, DETAIL_AGGREGATION,
    ENTITY_FILTER_FIELD,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, iqr, median, quantile, read_schema_sidecar,
    schema_sidecar_path, write_schema_sidecar, FeatureColumn, FeatureDType, FeatureError,
    FeatureReducer, FeatureRow, FeatureSchema, FeatureTable, OutputFormat, ReduceReport,
    DEFAULT_ACTIVITY_THRESHOLD, DEFAULT_SIGN_OFF_MARKER, FEATURE_SCHEMA_VERSION,
};
pub use observability::{
    init_logging, log_app_start, log_run_config, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    open_store, run_extraction, run_pipeline, run_reduction, window_plan, PipelineError,
    RunContext, RunSummary,
};
pub use ranges::{
    parse_bound, partition, partition_str, DateRange, RangeError, WindowPlan, WindowSpan,
};
pub use roster::{
    roster_sources, AuthorRoster, EntityRecord, RosterError, BOT_KEY, ENTITY_KEY,
    ROSTER_AGGREGATION,
};
pub use store::{InMemoryRecordStore, JsonDirStore, RecordStore, SqliteRecordStore, StoreError};
