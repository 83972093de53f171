use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use revelio::{
    build_feature_schema, open_store, run_extraction, run_pipeline, schema_sidecar_path,
    write_schema_sidecar, BackendError, Bucket, BucketKey, DuplicatePolicy, FeatureError,
    JsonDirStore, KeyValue, OutputFormat, PipelineConfig, PipelineError, RecordStore, RunContext,
    SearchBackend, SearchRequest, SearchResponse, StoreKind, WindowSpan,
};
use tempfile::tempdir;

type Doc = HashMap<String, KeyValue>;

/// Composite aggregation over an in-memory document list, keyed and paged like the real backend.
struct FakeIndex {
    docs: Vec<Doc>,
    requests: RefCell<Vec<SearchRequest>>,
    fail_for_entity: Option<String>,
}

impl FakeIndex {
    fn new(docs: Vec<Doc>) -> Self {
        Self {
            docs,
            requests: RefCell::new(Vec::new()),
            fail_for_entity: None,
        }
    }
}

fn field_name(field: &str) -> &str {
    field.strip_suffix(".keyword").unwrap_or(field)
}

fn sort_key(key: &BucketKey) -> String {
    serde_json::to_string(key).expect("bucket key serializes")
}

impl SearchBackend for FakeIndex {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError> {
        self.requests.borrow_mut().push(request.clone());

        if let Some(entity) = &self.fail_for_entity {
            if request
                .terms
                .iter()
                .any(|term| term.value.as_str() == Some(entity.as_str()))
            {
                return Err(BackendError::Status {
                    url: "fake://git/_search".to_string(),
                    status: 503,
                    body: "shard unavailable".to_string(),
                });
            }
        }

        let date_field = field_name(&request.date_field);
        let mut groups: BTreeMap<String, (BucketKey, u64, HashSet<String>)> = BTreeMap::new();
        let mut total_hits = 0;

        'docs: for doc in &self.docs {
            let Some(ts) = doc
                .get(date_field)
                .and_then(KeyValue::as_i64)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            else {
                continue;
            };
            if !request.range.contains(ts) {
                continue;
            }
            for term in &request.terms {
                if doc.get(field_name(&term.field)) != Some(&term.value) {
                    continue 'docs;
                }
            }
            total_hits += 1;

            let mut key = BucketKey::new();
            for source in &request.aggregation.sources {
                match doc.get(field_name(&source.field)) {
                    Some(value) => key.insert(source.name.clone(), value.clone()),
                    None if source.missing_bucket => key.insert(source.name.clone(), KeyValue::Null),
                    None => continue 'docs,
                }
            }

            let entry = groups
                .entry(sort_key(&key))
                .or_insert_with(|| (key, 0, HashSet::new()));
            entry.1 += 1;
            if let Some(hash) = doc.get("hash").and_then(KeyValue::as_str) {
                entry.2.insert(hash.to_string());
            }
        }

        let after = request.aggregation.after.as_ref().map(sort_key);
        let buckets: Vec<Bucket> = groups
            .into_iter()
            .filter(|(key, _)| after.as_ref().map_or(true, |after| key > after))
            .take(request.aggregation.size)
            .map(|(_, (key, doc_count, hashes))| Bucket {
                key,
                doc_count,
                distinct_count: Some(hashes.len() as u64),
            })
            .collect();
        let after_key = buckets.last().map(|bucket| bucket.key.clone());

        Ok(SearchResponse {
            buckets,
            after_key,
            total_hits,
        })
    }
}

fn commit(
    author: &str,
    bot: bool,
    hash: &str,
    at: DateTime<Utc>,
    files: i64,
    message: Option<&str>,
    repo: &str,
) -> Doc {
    let ms = at.timestamp_millis();
    let mut doc: Doc = HashMap::new();
    doc.insert("author_uuid".into(), author.into());
    doc.insert("author_bot".into(), KeyValue::Int(i64::from(bot)));
    doc.insert("author_name".into(), format!("{author} name").into());
    doc.insert("hash".into(), hash.into());
    doc.insert("files".into(), KeyValue::Int(files));
    doc.insert("lines_added".into(), KeyValue::Int(files * 10));
    doc.insert("lines_removed".into(), KeyValue::Int(files));
    doc.insert("utc_commit".into(), KeyValue::Int(ms));
    doc.insert("grimoire_creation_date".into(), KeyValue::Int(ms));
    doc.insert("author_date".into(), KeyValue::Int(ms));
    doc.insert(
        "commit_date_weekday".into(),
        KeyValue::Int(i64::from(at.weekday().number_from_monday())),
    );
    doc.insert("repo_name".into(), repo.into());
    doc.insert("time_to_commit_hours".into(), KeyValue::Float(0.5));
    if let Some(message) = message {
        doc.insert("message".into(), message.into());
    }
    doc
}

fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

/// alice: 12 distinct commits plus one re-indexed copy of `alice-0` in a later window.
/// dependabot: 10 bot commits. bob: 3 commits, below the activity threshold.
fn seeded_docs() -> Vec<Doc> {
    let mut docs = Vec::new();
    for i in 0..12i64 {
        let message = if i % 3 == 0 {
            "Fix build\n\nSigned-off-by: Alice <alice@example.org>"
        } else {
            "Refactor module"
        };
        docs.push(commit(
            "alice",
            false,
            &format!("alice-{i}"),
            day(2021, 1, 4) + Duration::days(5 * i),
            if i == 0 { 0 } else { i },
            Some(message),
            if i % 2 == 0 { "repo-a" } else { "repo-b" },
        ));
    }
    docs.push(commit(
        "alice",
        false,
        "alice-0",
        day(2021, 3, 10),
        0,
        Some("Fix build\n\nSigned-off-by: Alice <alice@example.org>"),
        "repo-c",
    ));
    for i in 0..10i64 {
        docs.push(commit(
            "dependabot",
            true,
            &format!("bot-{i}"),
            day(2021, 2, 1) + Duration::days(i),
            1,
            Some("Bump serde from 1.0.1 to 1.0.2"),
            "repo-a",
        ));
    }
    for i in 0..3i64 {
        docs.push(commit(
            "bob",
            false,
            &format!("bob-{i}"),
            day(2021, 1, 20) + Duration::days(i),
            2,
            None,
            "repo-b",
        ));
    }
    docs
}

fn config_in(root: &Path) -> PipelineConfig {
    PipelineConfig {
        date_start: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
        date_end: Utc.with_ymd_and_hms(2021, 4, 1, 0, 0, 0).unwrap(),
        window_span: WindowSpan::Days(30),
        page_size: 4,
        data_dir: root.join("data"),
        output_path: root.join("datasets/df_git.json"),
        ..PipelineConfig::default()
    }
}

fn read_lines(path: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn full_run_extracts_every_author_and_reduces_active_ones() {
    let temp = tempdir().unwrap();
    let cfg = config_in(temp.path());
    let backend = FakeIndex::new(seeded_docs());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    let summary = run_pipeline(&cfg, &backend, &store).unwrap();

    assert_eq!(summary.window_count, 3);
    assert_eq!(summary.roster_size, 3);
    assert_eq!(summary.entities_extracted, 3);
    assert_eq!(summary.records_written, 26);
    assert_eq!(summary.duplicate_hashes, 1);
    assert_eq!(summary.rows_emitted, 2);
    assert_eq!(summary.below_threshold, 1);
    assert_eq!(summary.failed_entity_count(), 0);
    assert_eq!(store.list_keys().unwrap(), vec!["alice", "bob", "dependabot"]);

    let rows = read_lines(&cfg.output_path);
    assert_eq!(rows.len(), 2);

    let alice = &rows[0];
    assert_eq!(alice["author_uuid"], "alice");
    assert_eq!(alice["author_bot"], false);
    assert_eq!(alice["git__num_commits"], 12);
    assert_eq!(alice["git__num_merge_commits"], 1);
    assert_eq!(alice["git__num_signed_commits"], 4);
    assert_eq!(alice["git__num_weekend_commits"], 4);
    assert_eq!(alice["git__num_repos"], 2);
    let ratio = alice["git__ratio_merge_commits"].as_f64().unwrap();
    assert!((ratio - 1.0 / 12.0).abs() < 1e-12);

    let bot = &rows[1];
    assert_eq!(bot["author_uuid"], "dependabot");
    assert_eq!(bot["author_bot"], true);
    assert_eq!(bot["git__num_commits"], 10);
    assert_eq!(bot["git__ratio_merge_commits"].as_f64(), Some(0.0));
    assert_eq!(bot["git__iqr_files"].as_f64(), Some(0.0));
    assert_eq!(bot["git__median_len_words_commit_message"].as_f64(), Some(6.0));

    let schema_path = schema_sidecar_path(&cfg.output_path);
    let schema: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(schema_path).unwrap()).unwrap();
    assert_eq!(schema["version"], 1);
    assert_eq!(schema["fingerprint"].as_str().unwrap().len(), 64);
}

#[test]
fn queries_follow_windows_oldest_first_with_pagination() {
    let temp = tempdir().unwrap();
    let cfg = config_in(temp.path());
    let backend = FakeIndex::new(seeded_docs());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    let mut ctx = RunContext::new();
    run_extraction(&mut ctx, &cfg, &backend, &store).unwrap();

    let requests = backend.requests.borrow();
    let alice_requests: Vec<&SearchRequest> = requests
        .iter()
        .filter(|request| {
            request
                .terms
                .iter()
                .any(|term| term.value.as_str() == Some("alice"))
        })
        .collect();
    assert!(alice_requests.len() > 3, "alice detail query should page");
    let starts: Vec<DateTime<Utc>> = alice_requests.iter().map(|r| r.range.start).collect();
    let mut sorted = starts.clone();
    sorted.sort();
    assert_eq!(starts, sorted);
    assert!(alice_requests.iter().any(|r| r.aggregation.after.is_some()));
    assert!(requests.iter().all(|r| r.index == "git"));
}

#[test]
fn repeated_runs_produce_byte_identical_output() {
    let temp = tempdir().unwrap();
    let cfg = config_in(temp.path());
    let backend = FakeIndex::new(seeded_docs());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    run_pipeline(&cfg, &backend, &store).unwrap();
    let first_alice = fs::read(store.path_for("alice")).unwrap();
    let first_table = fs::read(&cfg.output_path).unwrap();

    run_pipeline(&cfg, &backend, &store).unwrap();
    assert_eq!(fs::read(store.path_for("alice")).unwrap(), first_alice);
    assert_eq!(fs::read(&cfg.output_path).unwrap(), first_table);
}

#[test]
fn drop_by_hash_policy_keeps_first_occurrence_only() {
    let temp = tempdir().unwrap();
    let cfg = PipelineConfig {
        duplicate_policy: DuplicatePolicy::DropByHash,
        ..config_in(temp.path())
    };
    let backend = FakeIndex::new(seeded_docs());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    let summary = run_pipeline(&cfg, &backend, &store).unwrap();
    assert_eq!(summary.records_written, 25);
    assert_eq!(summary.dropped_duplicates, 1);

    let alice = store.read("alice").unwrap();
    assert_eq!(alice.len(), 12);
    let first = alice.iter().find(|record| record.hash == "alice-0").unwrap();
    assert_eq!(first.repo_name, "repo-a");
}

#[test]
fn failing_entity_is_reported_and_others_complete() {
    let temp = tempdir().unwrap();
    let cfg = config_in(temp.path());
    let mut backend = FakeIndex::new(seeded_docs());
    backend.fail_for_entity = Some("bob".to_string());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    let summary = run_pipeline(&cfg, &backend, &store).unwrap();
    assert_eq!(summary.entities_extracted, 2);
    assert_eq!(summary.extraction_failed.len(), 1);
    assert_eq!(summary.extraction_failed[0].entity_id, "bob");
    assert!(summary.extraction_failed[0].reason.contains("503"));
    assert_eq!(summary.rows_emitted, 2);
    assert_eq!(store.list_keys().unwrap(), vec!["alice", "dependabot"]);
}

#[test]
fn failed_entity_drops_records_from_an_earlier_run() {
    let temp = tempdir().unwrap();
    let cfg = config_in(temp.path());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    let first = run_pipeline(&cfg, &FakeIndex::new(seeded_docs()), &store).unwrap();
    assert_eq!(first.rows_emitted, 2);
    assert!(store.path_for("alice").exists());

    let mut backend = FakeIndex::new(seeded_docs());
    backend.fail_for_entity = Some("alice".to_string());
    let second = run_pipeline(&cfg, &backend, &store).unwrap();

    assert_eq!(second.extraction_failed.len(), 1);
    assert_eq!(second.extraction_failed[0].entity_id, "alice");
    assert!(!store.path_for("alice").exists());
    assert_eq!(store.list_keys().unwrap(), vec!["bob", "dependabot"]);
    assert_eq!(second.rows_emitted, 1);

    let rows = read_lines(&cfg.output_path);
    let ids: Vec<&str> = rows
        .iter()
        .filter_map(|row| row["author_uuid"].as_str())
        .collect();
    assert_eq!(ids, vec!["dependabot"]);
}

#[test]
fn roster_buckets_without_an_author_are_counted_in_the_summary() {
    let temp = tempdir().unwrap();
    let cfg = config_in(temp.path());
    let mut docs = seeded_docs();
    docs.push(commit(
        "",
        false,
        "orphan-1",
        day(2021, 2, 2),
        1,
        Some("Import history"),
        "repo-a",
    ));
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    let summary = run_pipeline(&cfg, &FakeIndex::new(docs), &store).unwrap();
    assert_eq!(summary.roster_size, 3);
    assert_eq!(summary.roster_skipped_buckets, 1);
    assert_eq!(summary.failed_entity_count(), 0);
}

#[test]
fn table_with_a_different_schema_is_not_overwritten() {
    let temp = tempdir().unwrap();
    let cfg = config_in(temp.path());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    fs::create_dir_all(cfg.output_path.parent().unwrap()).unwrap();
    fs::write(&cfg.output_path, "{\"legacy\":true}\n").unwrap();
    let mut legacy = build_feature_schema();
    legacy.columns.pop();
    legacy.fingerprint = "0".repeat(64);
    write_schema_sidecar(&cfg.output_path, &legacy).unwrap();

    let err = run_pipeline(&cfg, &FakeIndex::new(seeded_docs()), &store).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Feature(FeatureError::SchemaFingerprintMismatch { .. })
    ));
    assert_eq!(
        fs::read_to_string(&cfg.output_path).unwrap(),
        "{\"legacy\":true}\n"
    );

    fs::remove_file(schema_sidecar_path(&cfg.output_path)).unwrap();
    let summary = run_pipeline(&cfg, &FakeIndex::new(seeded_docs()), &store).unwrap();
    assert_eq!(read_lines(&cfg.output_path).len(), summary.rows_emitted as usize);
}

#[test]
fn sqlite_store_and_csv_export_with_roster() {
    let temp = tempdir().unwrap();
    let cfg = PipelineConfig {
        store_kind: StoreKind::Sqlite,
        output_format: OutputFormat::Csv,
        output_path: temp.path().join("datasets/df_git.csv"),
        roster_export_path: Some(temp.path().join("datasets/df_git_authors.csv")),
        ..config_in(temp.path())
    };
    let backend = FakeIndex::new(seeded_docs());
    let store = open_store(&cfg).unwrap();

    let summary = run_pipeline(&cfg, &backend, store.as_ref()).unwrap();
    assert_eq!(summary.rows_emitted, 2);
    assert!(cfg.sqlite_path().exists());

    let roster = fs::read_to_string(temp.path().join("datasets/df_git_authors.csv")).unwrap();
    assert_eq!(
        roster,
        "author_uuid,author_bot,doc_count\nalice,false,13\nbob,false,3\ndependabot,true,10\n"
    );

    let table = fs::read_to_string(&cfg.output_path).unwrap();
    let mut lines = table.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("git__num_merge_commits,git__num_weekend_commits"));
    assert!(header.ends_with("author_uuid,author_name,author_bot"));
    assert_eq!(lines.count(), 2);
}

#[test]
fn export_disabled_skips_table_but_reports_rows() {
    let temp = tempdir().unwrap();
    let cfg = PipelineConfig {
        export_enabled: false,
        ..config_in(temp.path())
    };
    let backend = FakeIndex::new(seeded_docs());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();

    let summary = run_pipeline(&cfg, &backend, &store).unwrap();
    assert_eq!(summary.rows_emitted, 2);
    assert!(summary.output_path.is_none());
    assert!(!cfg.output_path.exists());
}

#[test]
fn roster_backend_failure_aborts_the_run() {
    struct DownBackend;
    impl SearchBackend for DownBackend {
        fn search(&self, _request: &SearchRequest) -> Result<SearchResponse, BackendError> {
            Err(BackendError::HttpRequest {
                url: "http://127.0.0.1:9200/git/_search".to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    let temp = tempdir().unwrap();
    let cfg = config_in(temp.path());
    let store = JsonDirStore::open(&cfg.data_dir).unwrap();
    let err = run_pipeline(&cfg, &DownBackend, &store).unwrap_err();
    assert!(err.to_string().contains("roster query failed"));
    assert!(store.list_keys().unwrap().is_empty());
}
