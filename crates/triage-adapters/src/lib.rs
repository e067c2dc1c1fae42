//! Source collaborators and the source record mapper.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use triage_storage::{FetchError, HttpClientConfig, HttpJsonClient};

pub mod mapper;
pub mod query;

pub use mapper::{map_record, normalize_status, Rejected, SourceValue, IDENTIFIER_FIELDS};
pub use query::{compare_ids, SourceFields, SourceFilter, SourceQuery};

pub const CRATE_NAME: &str = "triage-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// A sortable, limitable collection of loosely typed sale documents.
#[async_trait]
pub trait SaleSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Documents matching `query.filter`, ascending by (timestamp, id), at
    /// most `query.limit` of them.
    async fn fetch_batch(&self, query: &SourceQuery) -> Result<Vec<JsonValue>, SourceError>;
}

/// In-process source evaluating queries the way the remote collection does.
#[derive(Debug, Default)]
pub struct StaticSaleSource {
    source_id: String,
    documents: Mutex<Vec<JsonValue>>,
}

impl StaticSaleSource {
    pub fn new(source_id: impl Into<String>, documents: Vec<JsonValue>) -> Self {
        Self {
            source_id: source_id.into(),
            documents: Mutex::new(documents),
        }
    }

    pub async fn push(&self, document: JsonValue) {
        self.documents.lock().await.push(document);
    }

    /// Replaces the stored document whose `id_field` equals `id`, or appends.
    pub async fn replace(&self, id_field: &str, id: &str, document: JsonValue) {
        let mut documents = self.documents.lock().await;
        let position = documents.iter().position(|doc| {
            mapper::decode_identifier(SourceValue::classify(mapper::lookup(doc, id_field)))
                .as_deref()
                == Some(id)
        });
        match position {
            Some(index) => documents[index] = document,
            None => documents.push(document),
        }
    }
}

#[async_trait]
impl SaleSource for StaticSaleSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(&self, query: &SourceQuery) -> Result<Vec<JsonValue>, SourceError> {
        let documents = self.documents.lock().await;
        let mut matching = documents
            .iter()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| query.compare_documents(a, b));
        matching.truncate(query.limit);
        Ok(matching)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub data_source: String,
    pub database: String,
    pub collection: String,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    documents: Vec<JsonValue>,
}

/// Remote collection behind a Data-API style `find` endpoint.
#[derive(Debug)]
pub struct HttpSaleSource {
    config: HttpSourceConfig,
    http: HttpJsonClient,
}

impl HttpSaleSource {
    pub fn new(config: HttpSourceConfig, http: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            config,
            http: HttpJsonClient::new(http)?,
        })
    }

    pub fn request_body(&self, query: &SourceQuery) -> JsonValue {
        json!({
            "dataSource": self.config.data_source,
            "database": self.config.database,
            "collection": self.config.collection,
            "filter": query.filter_document(),
            "sort": query.sort_document(),
            "limit": query.limit,
        })
    }
}

#[async_trait]
impl SaleSource for HttpSaleSource {
    fn source_id(&self) -> &str {
        &self.config.collection
    }

    async fn fetch_batch(&self, query: &SourceQuery) -> Result<Vec<JsonValue>, SourceError> {
        let mut headers = Vec::new();
        if let Some(key) = &self.config.api_key {
            headers.push(("api-key", key.clone()));
        }
        let body = self.request_body(query);
        tracing::debug!(filter = %body["filter"], limit = query.limit, "querying source");
        let response: FindResponse = self
            .http
            .post_json(&self.config.url, &headers, &body)
            .await?;
        Ok(response.documents)
    }
}

/// Reads source documents from a file: a JSON array, a `{"documents": [..]}`
/// envelope, or one JSON document per line (mongoexport output).
pub fn load_documents(path: impl AsRef<Path>) -> Result<Vec<JsonValue>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_documents(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_documents(data: &str) -> Result<Vec<JsonValue>> {
    let trimmed = data.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("parsing JSON array of documents");
    }
    if let Ok(JsonValue::Object(mut envelope)) = serde_json::from_str::<JsonValue>(trimmed) {
        return match envelope.remove("documents") {
            Some(JsonValue::Array(documents)) => Ok(documents),
            Some(_) => anyhow::bail!("`documents` is not an array"),
            None => Ok(vec![JsonValue::Object(envelope)]),
        };
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("parsing line {}", index + 1))
        })
        .collect()
}
