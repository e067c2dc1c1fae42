//! Persistence contracts for sales ingestion plus the Postgres and in-memory
//! backends, and the retrying HTTP client used by remote sources.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use triage_core::{
    Comment, IngestionRun, NormalizedSale, RunCounts, Sale, SaleDetail, StatusUpdate, Tag,
};
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpJsonClient, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "triage-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sale not found: {0}")]
    SaleNotFound(Uuid),
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error("ingestion run not found: {0}")]
    RunNotFound(Uuid),
    #[error("ingestion run {0} is already closed")]
    RunAlreadyClosed(Uuid),
    #[error(
        "stale edit: sale {sale_id} was changed at {current_updated_at} after this edit started; reload and try again"
    )]
    StaleEdit {
        sale_id: Uuid,
        current_updated_at: DateTime<Utc>,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What a batch upsert did, as seen by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
}

/// One opaque string per named cursor key.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Audit log of ingestion attempts. Each run closes exactly once; closing a
/// closed run fails with [`StoreError::RunAlreadyClosed`] and changes nothing.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn begin(&self) -> StoreResult<Uuid>;
    async fn complete_success(&self, run_id: Uuid, counts: RunCounts) -> StoreResult<()>;
    async fn complete_failure(&self, run_id: Uuid, message: &str) -> StoreResult<()>;
    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<IngestionRun>>;
}

/// Upsert target for ingestion, keyed by external id.
///
/// `upsert` is all-or-nothing for the batch. On conflict only source-derived
/// fields, the raw payload and the sync tag change; operational fields keep
/// their stored values.
#[async_trait]
pub trait SaleStore: Send + Sync {
    async fn existing_external_ids(&self, external_ids: &[String]) -> StoreResult<HashSet<String>>;
    async fn upsert(&self, records: &[NormalizedSale], sync_tag: &str) -> StoreResult<UpsertOutcome>;
}

/// Operator mutations on the operational fields of a sale.
#[async_trait]
pub trait SaleOperations: Send + Sync {
    async fn sale_detail(&self, sale_id: Uuid) -> StoreResult<SaleDetail>;
    async fn update_status(&self, sale_id: Uuid, update: &StatusUpdate) -> StoreResult<Sale>;
    async fn add_tag(&self, sale_id: Uuid, name: &str) -> StoreResult<Tag>;
    async fn remove_tag(&self, sale_id: Uuid, name: &str) -> StoreResult<bool>;
    async fn add_comment(&self, sale_id: Uuid, author_id: Uuid, body: &str) -> StoreResult<Comment>;
    async fn assign_owner(&self, sale_id: Uuid, owner: Option<Uuid>) -> StoreResult<Sale>;
}

pub(crate) fn validate_batch(records: &[NormalizedSale]) -> StoreResult<()> {
    if let Some(position) = records
        .iter()
        .position(|r| r.external_id.trim().is_empty())
    {
        return Err(StoreError::InvalidInput(format!(
            "record {position} in upsert batch has an empty external id"
        )));
    }
    Ok(())
}

pub(crate) fn normalize_tag_name(name: &str) -> StoreResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidInput("tag name cannot be empty".into()));
    }
    Ok(name.to_string())
}

pub(crate) fn normalize_comment_body(body: &str) -> StoreResult<String> {
    let body = body.trim();
    if body.is_empty() {
        return Err(StoreError::InvalidInput("comment body cannot be empty".into()));
    }
    Ok(body.to_string())
}

pub(crate) fn normalize_problem_reason(reason: Option<&str>) -> Option<String> {
    reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(ToString::to_string)
}
