//! Search backend seam: composite aggregation requests and their typed results.

use std::hash::{Hash, Hasher};

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::ranges::DateRange;

/// Scalar value of one composite bucket key field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl KeyValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => json!(b),
            Self::Int(i) => json!(i),
            Self::Float(f) => json!(f),
            Self::Str(s) => json!(s),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Terms aggregations on boolean fields key as `1`/`0` or `"true"`/`"false"`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            Self::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for KeyValue {}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Str(s) => s.hash(state),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Field values identifying one bucket, in composite source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BucketKey {
    fields: Vec<(String, KeyValue)>,
}

impl BucketKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Replaces the value when `name` is already present so keys stay unique.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<KeyValue>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&KeyValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        Value::Object(map)
    }
}

impl Serialize for BucketKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub key: BucketKey,
    pub doc_count: u64,
    pub distinct_count: Option<u64>,
}

/// One composite source: `name` is the key field in the response, `field` the indexed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSource {
    pub name: String,
    pub field: String,
    /// Emit a null-keyed bucket for documents lacking the field instead of dropping them.
    pub missing_bucket: bool,
}

impl BucketSource {
    pub fn required(name: &str, field: &str) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            missing_bucket: false,
        }
    }

    pub fn optional(name: &str, field: &str) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            missing_bucket: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermFilter {
    pub field: String,
    pub value: KeyValue,
}

impl TermFilter {
    pub fn new(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeSpec {
    pub name: String,
    pub sources: Vec<BucketSource>,
    pub size: usize,
    pub after: Option<BucketKey>,
    pub cardinality_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub index: String,
    pub date_field: String,
    /// Filtered as `gte start`, `lt end`.
    pub range: DateRange,
    pub terms: Vec<TermFilter>,
    pub aggregation: CompositeSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResponse {
    pub buckets: Vec<Bucket>,
    pub after_key: Option<BucketKey>,
    pub total_hits: u64,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("backend returned HTTP {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode backend response: {0}")]
    Decode(String),
    #[error("backend response has no aggregation named '{0}'")]
    MissingAggregation(String),
}

/// Stateless request/response access to the search index.
pub trait SearchBackend {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError>;
}

impl<T: SearchBackend + ?Sized> SearchBackend for &T {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError> {
        (**self).search(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticsearchConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub accept_invalid_certs: bool,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9200".to_string(),
            timeout_ms: 60_000,
            username: None,
            password: None,
            accept_invalid_certs: false,
        }
    }
}

pub struct ElasticsearchBackend {
    client: reqwest::blocking::Client,
    cfg: ElasticsearchConfig,
}

impl ElasticsearchBackend {
    pub fn new(cfg: ElasticsearchConfig) -> Result<Self, BackendError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()
            .map_err(|err| BackendError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client, cfg })
    }

    fn search_url(&self, index: &str) -> String {
        format!("{}/{}/_search", self.cfg.base_url.trim_end_matches('/'), index)
    }
}

impl SearchBackend for ElasticsearchBackend {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError> {
        let url = self.search_url(&request.index);
        let body = build_search_body(request);
        debug!(
            component = "backend",
            event = "backend.search.request",
            url = %url,
            aggregation = %request.aggregation.name,
            has_after = request.aggregation.after.is_some()
        );

        let mut builder = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
        if let Some(username) = &self.cfg.username {
            builder = builder.basic_auth(username, self.cfg.password.as_deref());
        }

        let response = builder.send().map_err(|err| BackendError::HttpRequest {
            url: url.clone(),
            message: err.to_string(),
        })?;

        let status = response.status();
        let text = response.text().map_err(|err| BackendError::HttpRequest {
            url: url.clone(),
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(BackendError::Status {
                url,
                status: status.as_u16(),
                body: text,
            });
        }

        let payload: Value =
            serde_json::from_str(&text).map_err(|err| BackendError::Decode(err.to_string()))?;
        parse_search_response(&request.aggregation, &payload)
    }
}

pub fn build_search_body(request: &SearchRequest) -> Value {
    let mut filters = vec![json!({
        "range": {
            request.date_field.as_str(): {
                "gte": request.range.start.to_rfc3339(),
                "lt": request.range.end.to_rfc3339(),
            }
        }
    })];
    for term in &request.terms {
        filters.push(json!({ "term": { term.field.as_str(): term.value.to_json() } }));
    }

    let spec = &request.aggregation;
    let sources: Vec<Value> = spec
        .sources
        .iter()
        .map(|source| {
            let mut terms = json!({ "field": source.field });
            if source.missing_bucket {
                terms["missing_bucket"] = json!(true);
            }
            json!({ source.name.as_str(): { "terms": terms } })
        })
        .collect();

    let mut composite = json!({ "size": spec.size, "sources": sources });
    if let Some(after) = &spec.after {
        composite["after"] = after.to_json();
    }

    let mut aggregation = json!({ "composite": composite });
    if let Some(field) = &spec.cardinality_field {
        aggregation["aggs"] = json!({
            CARDINALITY_AGG_NAME: { "cardinality": { "field": field } }
        });
    }

    json!({
        "size": 0,
        "track_total_hits": true,
        "query": { "bool": { "filter": filters } },
        "aggs": { spec.name.as_str(): aggregation },
    })
}

pub const CARDINALITY_AGG_NAME: &str = "distinct_count";

pub fn parse_search_response(
    spec: &CompositeSpec,
    payload: &Value,
) -> Result<SearchResponse, BackendError> {
    let total_hits = match &payload["hits"]["total"] {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::Object(obj) => obj.get("value").and_then(Value::as_u64).unwrap_or(0),
        _ => 0,
    };

    let aggregation = payload
        .get("aggregations")
        .and_then(|aggs| aggs.get(&spec.name))
        .ok_or_else(|| BackendError::MissingAggregation(spec.name.clone()))?;

    let raw_buckets = match aggregation.get("buckets") {
        Some(Value::Array(items)) => items.as_slice(),
        Some(_) => {
            return Err(BackendError::Decode(format!(
                "aggregation '{}' buckets is not an array",
                spec.name
            )))
        }
        None => &[],
    };

    let mut buckets = Vec::with_capacity(raw_buckets.len());
    for raw in raw_buckets {
        let key_obj = raw
            .get("key")
            .and_then(Value::as_object)
            .ok_or_else(|| BackendError::Decode("bucket without object key".to_string()))?;
        buckets.push(Bucket {
            key: key_in_source_order(spec, key_obj),
            doc_count: raw.get("doc_count").and_then(Value::as_u64).unwrap_or(0),
            distinct_count: raw
                .get(CARDINALITY_AGG_NAME)
                .and_then(|metric| metric.get("value"))
                .and_then(Value::as_u64),
        });
    }

    let after_key = aggregation
        .get("after_key")
        .and_then(Value::as_object)
        .map(|obj| key_in_source_order(spec, obj));

    Ok(SearchResponse {
        buckets,
        after_key,
        total_hits,
    })
}

/// Absent source fields become `KeyValue::Null`.
fn key_in_source_order(spec: &CompositeSpec, obj: &Map<String, Value>) -> BucketKey {
    let mut key = BucketKey::new();
    for source in &spec.sources {
        let value = obj
            .get(&source.name)
            .map(KeyValue::from_json)
            .unwrap_or(KeyValue::Null);
        key.insert(source.name.clone(), value);
    }
    key
}
