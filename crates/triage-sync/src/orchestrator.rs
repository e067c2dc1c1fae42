//! One ingestion run: cursor → fetch → map → dedup → classify → upsert →
//! cursor → ledger.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, info_span, warn, Instrument};
use triage_adapters::{compare_ids, map_record, SaleSource, SourceError, SourceFields, SourceQuery};
use triage_core::{CursorIdKind, CursorPosition, NormalizedSale, RunCounts};
use triage_storage::{CursorStore, MemoryStore, RunLedger, SaleStore, StoreError};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub batch_size: usize,
    pub cursor_key: String,
    pub sync_tag_prefix: String,
    pub fields: SourceFields,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            cursor_key: "sales_ingestion_cursor".to_string(),
            sync_tag_prefix: "ingest".to_string(),
            fields: SourceFields::default(),
        }
    }
}

/// Store handles an orchestrator works against. Built once at startup.
#[derive(Clone)]
pub struct IngestContext {
    pub source: Arc<dyn SaleSource>,
    pub sales: Arc<dyn SaleStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub ledger: Arc<dyn RunLedger>,
    pub settings: IngestSettings,
}

impl IngestContext {
    pub fn new<S>(source: Arc<dyn SaleSource>, store: Arc<S>, settings: IngestSettings) -> Self
    where
        S: SaleStore + CursorStore + RunLedger + 'static,
    {
        Self {
            source,
            sales: store.clone(),
            cursors: store.clone(),
            ledger: store,
            settings,
        }
    }

    pub fn in_memory(source: Arc<dyn SaleSource>, store: Arc<MemoryStore>) -> Self {
        Self::new(source, store, IngestSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: RunCounts,
    /// Encoded cursor written by this run, if it advanced.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Another run of this orchestrator was in flight.
    Skipped,
    Completed(RunSummary),
    /// `run_id` is `None` when the ledger entry could not be opened.
    Failed {
        run_id: Option<Uuid>,
        message: String,
    },
}

#[derive(Debug, Error)]
enum IngestError {
    #[error("source fetch failed: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mapped, deduplicated batch plus the source documents that mapped.
#[derive(Debug, Default)]
pub(crate) struct PreparedBatch<'a> {
    pub records: Vec<NormalizedSale>,
    pub rejected: u64,
    pub accepted: Vec<&'a JsonValue>,
}

pub(crate) fn prepare_batch(documents: &[JsonValue]) -> PreparedBatch<'_> {
    let mut mapped = Vec::with_capacity(documents.len());
    let mut accepted = Vec::with_capacity(documents.len());
    let mut rejected = 0u64;
    for (position, document) in documents.iter().enumerate() {
        match map_record(document) {
            Ok(record) => {
                mapped.push(record);
                accepted.push(document);
            }
            Err(reason) => {
                rejected += 1;
                warn!(position, %reason, "rejected source record");
            }
        }
    }
    PreparedBatch {
        records: dedup_last_write_wins(mapped),
        rejected,
        accepted,
    }
}

/// Keeps one record per external id: the last one seen, at the position of
/// the first.
pub fn dedup_last_write_wins(records: Vec<NormalizedSale>) -> Vec<NormalizedSale> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut deduped: Vec<NormalizedSale> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&record.external_id) {
            Some(&index) => deduped[index] = record,
            None => {
                positions.insert(record.external_id.clone(), deduped.len());
                deduped.push(record);
            }
        }
    }
    deduped
}

/// High-water mark of a fetched batch, read through the same timestamp and id
/// fields the source query filters and sorts on. Documents without the query
/// id are skipped. Documents without the query timestamp only set the cursor
/// when nothing in the batch has one.
pub fn newest_cursor<'a>(
    query: &SourceQuery,
    documents: impl IntoIterator<Item = &'a JsonValue>,
) -> Option<CursorPosition> {
    let mut timestamped: Option<(DateTime<Utc>, String, CursorIdKind)> = None;
    let mut untimed: Option<(String, CursorIdKind)> = None;
    for document in documents {
        let Some((id, kind)) = query.typed_id_of(document) else {
            continue;
        };
        match query.timestamp_of(document) {
            Some(ts) => {
                let newer = timestamped.as_ref().map_or(true, |(best_ts, best_id, _)| {
                    ts.cmp(best_ts).then_with(|| compare_ids(&id, best_id)) == std::cmp::Ordering::Greater
                });
                if newer {
                    timestamped = Some((ts, id, kind));
                }
            }
            None => {
                let newer = untimed
                    .as_ref()
                    .map_or(true, |(best_id, _)| compare_ids(&id, best_id) == std::cmp::Ordering::Greater);
                if newer {
                    untimed = Some((id, kind));
                }
            }
        }
    }
    match (timestamped, untimed) {
        (Some((ts, id, kind)), _) => Some(CursorPosition::new(Some(ts), id).with_id_kind(kind)),
        (None, Some((id, kind))) => Some(CursorPosition::new(None, id).with_id_kind(kind)),
        (None, None) => None,
    }
}

/// Splits deduplicated records into (inserted, updated) by a single
/// existence lookup made before the upsert.
pub(crate) async fn classify_existing(
    sales: &dyn SaleStore,
    records: &[NormalizedSale],
) -> Result<(u64, u64), StoreError> {
    if records.is_empty() {
        return Ok((0, 0));
    }
    let ids = records
        .iter()
        .map(|r| r.external_id.clone())
        .collect::<Vec<_>>();
    let existing: HashSet<String> = sales.existing_external_ids(&ids).await?;
    let updated = ids.iter().filter(|id| existing.contains(*id)).count() as u64;
    Ok((ids.len() as u64 - updated, updated))
}

struct RunGuard<'a> {
    running: &'a AtomicBool,
    idle: &'a Notify,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool, idle: &'a Notify) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { running, idle })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

pub struct IngestionOrchestrator {
    ctx: IngestContext,
    running: AtomicBool,
    shutting_down: AtomicBool,
    idle: Notify,
}

impl IngestionOrchestrator {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            ctx,
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    pub fn context(&self) -> &IngestContext {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Runs started after this call skip the source fetch.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn clear_shutdown(&self) {
        self.shutting_down.store(false, Ordering::Release);
    }

    /// Resolves once no run is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    /// Executes one run. Never returns an error: failures are recorded in
    /// the run ledger and reported as [`RunOutcome::Failed`].
    pub async fn run_once(&self) -> RunOutcome {
        let Some(_guard) = RunGuard::acquire(&self.running, &self.idle) else {
            warn!("ingestion run already in progress; skipping trigger");
            return RunOutcome::Skipped;
        };

        let started_at = Utc::now();
        let run_id = match self.ctx.ledger.begin().await {
            Ok(run_id) => run_id,
            Err(err) => {
                error!(error = %err, "could not open ingestion run");
                return RunOutcome::Failed {
                    run_id: None,
                    message: err.to_string(),
                };
            }
        };

        let span = info_span!("ingest_run", %run_id);
        async {
            let result = match self.execute(run_id).await {
                Ok((counts, cursor)) => self
                    .ctx
                    .ledger
                    .complete_success(run_id, counts)
                    .await
                    .map(|_| (counts, cursor))
                    .map_err(IngestError::from),
                Err(err) => Err(err),
            };

            match result {
                Ok((counts, cursor)) => {
                    info!(
                        processed = counts.processed,
                        inserted = counts.inserted,
                        updated = counts.updated,
                        rejected = counts.rejected,
                        "ingestion run completed"
                    );
                    RunOutcome::Completed(RunSummary {
                        run_id,
                        started_at,
                        finished_at: Utc::now(),
                        counts,
                        cursor,
                    })
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(error = %message, "ingestion run failed");
                    if let Err(ledger_err) = self.ctx.ledger.complete_failure(run_id, &message).await {
                        error!(error = %ledger_err, "could not record ingestion failure");
                    }
                    RunOutcome::Failed {
                        run_id: Some(run_id),
                        message,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run_id: Uuid) -> Result<(RunCounts, Option<String>), IngestError> {
        let settings = &self.ctx.settings;
        let stored = self.ctx.cursors.get(&settings.cursor_key).await?;
        let cursor = stored.as_deref().and_then(CursorPosition::decode);
        let query = SourceQuery::new(cursor.as_ref(), settings.fields.clone(), settings.batch_size);

        let documents = if self.is_shutting_down() {
            debug!("shutting down; skipping source fetch");
            Vec::new()
        } else {
            debug!(filter = ?query.filter, limit = query.limit, "fetching batch");
            self.ctx.source.fetch_batch(&query).await?
        };

        let batch = prepare_batch(&documents);
        let (inserted, updated) = classify_existing(self.ctx.sales.as_ref(), &batch.records).await?;
        let counts = RunCounts {
            processed: batch.records.len() as u64,
            inserted,
            updated,
            rejected: batch.rejected,
        };

        if !batch.records.is_empty() {
            let sync_tag = format!("{}:{}", settings.sync_tag_prefix, run_id);
            let outcome = self.ctx.sales.upsert(&batch.records, &sync_tag).await?;
            if outcome.inserted != inserted {
                debug!(
                    expected = inserted,
                    store = outcome.inserted,
                    "store insert count differs from pre-upsert classification"
                );
            }
        }

        let encoded = match newest_cursor(&query, batch.accepted.iter().copied()) {
            Some(position) => {
                let encoded = position.encode();
                self.ctx.cursors.set(&settings.cursor_key, &encoded).await?;
                Some(encoded)
            }
            None => {
                if !documents.is_empty() {
                    warn!(
                        fetched = documents.len(),
                        "no mapped record carries the cursor fields; ingestion may be stalled on this batch"
                    );
                }
                None
            }
        };

        Ok((counts, encoded))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use triage_adapters::StaticSaleSource;
    use triage_core::{RunStatus, SaleStatus, StatusUpdate};
    use triage_storage::{SaleOperations, StoreResult, UpsertOutcome};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).single().unwrap()
    }

    fn sale(id: &str, created_at: Option<DateTime<Utc>>) -> NormalizedSale {
        NormalizedSale {
            external_id: id.to_string(),
            listing_id: None,
            event_id: None,
            quantity: None,
            price: None,
            currency: None,
            buyer_email: None,
            status: None,
            source_created_at: created_at,
            source_updated_at: None,
            raw: json!({ "_id": id }),
        }
    }

    fn scenario_documents() -> Vec<JsonValue> {
        vec![
            json!({ "_id": "A", "createdAt": "2026-03-01T10:00:00Z", "status": "SOLD", "price": 40 }),
            json!({ "_id": "B", "createdAt": "2026-03-01T10:05:00Z", "price": "55.10" }),
            json!({ "_id": { "unexpected": true }, "createdAt": "2026-03-01T10:02:00Z", "status": "INITIATED" }),
        ]
    }

    fn orchestrator(source: Arc<dyn SaleSource>, store: Arc<MemoryStore>) -> IngestionOrchestrator {
        IngestionOrchestrator::new(IngestContext::in_memory(source, store))
    }

    fn completed(outcome: RunOutcome) -> RunSummary {
        match outcome {
            RunOutcome::Completed(summary) => summary,
            other => panic!("expected completed run, got {other:?}"),
        }
    }

    fn text_cursor(created_at: Option<DateTime<Utc>>, id: &str) -> CursorPosition {
        CursorPosition::new(created_at, id).with_id_kind(CursorIdKind::Text)
    }

    async fn stored_cursor(store: &MemoryStore) -> Option<CursorPosition> {
        CursorStore::get(store, "sales_ingestion_cursor")
            .await
            .unwrap()
            .and_then(|v| CursorPosition::decode(&v))
    }

    #[tokio::test]
    async fn three_record_scenario() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSaleSource::new("sales", scenario_documents()));
        let orch = orchestrator(source, store.clone());

        let summary = completed(orch.run_once().await);
        assert_eq!(
            summary.counts,
            RunCounts { processed: 2, inserted: 2, updated: 0, rejected: 1 }
        );

        let a = store.sale_by_external_id("A").await.unwrap();
        assert_eq!(a.status, SaleStatus::Completed);
        let b = store.sale_by_external_id("B").await.unwrap();
        assert_eq!(b.status, SaleStatus::Received);
        assert_eq!(b.price, Some(55.1));
        assert_eq!(store.sales().await.len(), 2);
        assert_eq!(
            b.sync_state.as_deref(),
            Some(format!("ingest:{}", summary.run_id).as_str())
        );

        assert_eq!(stored_cursor(&store).await, Some(text_cursor(Some(at(10, 5)), "B")));

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].counts.processed, 2);
        assert_eq!(runs[0].counts.rejected, 1);
    }

    #[tokio::test]
    async fn second_run_without_new_data_is_a_zero_success() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSaleSource::new("sales", scenario_documents()));
        let orch = orchestrator(source, store.clone());

        completed(orch.run_once().await);
        let cursor_before = stored_cursor(&store).await;

        let second = completed(orch.run_once().await);
        assert_eq!(second.counts, RunCounts::default());
        assert_eq!(second.cursor, None);
        assert_eq!(stored_cursor(&store).await, cursor_before);

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Success));
    }

    #[tokio::test]
    async fn new_source_records_are_picked_up_after_the_cursor() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSaleSource::new("sales", scenario_documents()));
        let orch = orchestrator(source.clone(), store.clone());
        completed(orch.run_once().await);

        // same instant as the cursor, larger id
        source
            .push(json!({ "_id": "C", "createdAt": "2026-03-01T10:05:00Z" }))
            .await;
        source
            .push(json!({ "_id": "D", "createdAt": "2026-03-01T11:00:00Z" }))
            .await;
        let summary = completed(orch.run_once().await);
        assert_eq!(summary.counts.inserted, 2);
        assert_eq!(stored_cursor(&store).await, Some(text_cursor(Some(at(11, 0)), "D")));
    }

    #[tokio::test]
    async fn batch_size_bounds_each_run() {
        let store = Arc::new(MemoryStore::new());
        let documents = (0..5)
            .map(|i| json!({ "_id": format!("S{i}"), "createdAt": format!("2026-03-01T10:0{i}:00Z") }))
            .collect();
        let source = Arc::new(StaticSaleSource::new("sales", documents));
        let settings = IngestSettings { batch_size: 2, ..IngestSettings::default() };
        let orch = IngestionOrchestrator::new(IngestContext::new(source, store.clone(), settings));

        let processed = [
            completed(orch.run_once().await).counts.processed,
            completed(orch.run_once().await).counts.processed,
            completed(orch.run_once().await).counts.processed,
            completed(orch.run_once().await).counts.processed,
        ];
        assert_eq!(processed, [2, 2, 1, 0]);
        assert_eq!(store.sales().await.len(), 5);
    }

    #[tokio::test]
    async fn two_of_five_unidentifiable_records_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSaleSource::new(
            "sales",
            vec![
                json!({ "_id": "1", "createdAt": "2026-03-01T10:00:00Z" }),
                json!({ "ticketGroupId": 2, "createdAt": "2026-03-01T10:01:00Z" }),
                json!({ "price": 10, "createdAt": "2026-03-01T10:02:00Z" }),
                json!({ "listingId": "L-4", "createdAt": "2026-03-01T10:03:00Z" }),
                json!({ "_id": "", "createdAt": "2026-03-01T10:04:00Z" }),
            ],
        ));
        let summary = completed(orchestrator(source, store).run_once().await);
        assert_eq!(summary.counts.processed, 3);
        assert_eq!(summary.counts.rejected, 2);
    }

    #[tokio::test]
    async fn all_rejected_batch_leaves_cursor_alone() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSaleSource::new(
            "sales",
            vec![json!({ "createdAt": "2026-03-01T10:00:00Z" })],
        ));
        let summary = completed(orchestrator(source, store.clone()).run_once().await);
        assert_eq!(summary.counts.rejected, 1);
        assert_eq!(summary.counts.processed, 0);
        assert_eq!(stored_cursor(&store).await, None);
    }

    #[derive(Default)]
    struct RecordingSales {
        inner: MemoryStore,
        batches: StdMutex<Vec<Vec<NormalizedSale>>>,
    }

    #[async_trait]
    impl SaleStore for RecordingSales {
        async fn existing_external_ids(&self, ids: &[String]) -> StoreResult<HashSet<String>> {
            self.inner.existing_external_ids(ids).await
        }

        async fn upsert(&self, records: &[NormalizedSale], tag: &str) -> StoreResult<UpsertOutcome> {
            self.batches.lock().unwrap().push(records.to_vec());
            self.inner.upsert(records, tag).await
        }
    }

    #[tokio::test]
    async fn duplicate_ids_in_a_batch_upsert_once_with_the_later_values() {
        let store = Arc::new(MemoryStore::new());
        let sales = Arc::new(RecordingSales::default());
        let source = Arc::new(StaticSaleSource::new(
            "sales",
            vec![
                json!({ "_id": "A", "createdAt": "2026-03-01T10:00:00Z", "price": 10 }),
                json!({ "_id": "B", "createdAt": "2026-03-01T10:00:30Z", "price": 1 }),
                json!({ "_id": "A", "createdAt": "2026-03-01T10:01:00Z", "price": 12 }),
            ],
        ));
        let ctx = IngestContext {
            source,
            sales: sales.clone(),
            cursors: store.clone(),
            ledger: store.clone(),
            settings: IngestSettings::default(),
        };
        let summary = completed(IngestionOrchestrator::new(ctx).run_once().await);
        assert_eq!(summary.counts.processed, 2);
        assert_eq!(summary.counts.inserted, 2);

        let batches = sales.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        let a_records = batches[0]
            .iter()
            .filter(|r| r.external_id == "A")
            .collect::<Vec<_>>();
        assert_eq!(a_records.len(), 1);
        assert_eq!(a_records[0].price, Some(12.0));
        assert_eq!(batches[0][0].external_id, "A");

        assert_eq!(stored_cursor(&store).await, Some(text_cursor(Some(at(10, 1)), "A")));
    }

    #[test]
    fn null_timestamp_never_becomes_the_cursor_when_others_have_one() {
        let query = SourceQuery::new(None, SourceFields::default(), 10);
        let documents = [
            json!({ "_id": "t1", "createdAt": "2026-03-01T10:00:00Z" }),
            json!({ "_id": "t2", "createdAt": "2026-03-01T10:05:00Z" }),
            json!({ "_id": "t3" }),
        ];
        assert_eq!(newest_cursor(&query, &documents), Some(text_cursor(Some(at(10, 5)), "t2")));

        let untimed = [json!({ "_id": 9 }), json!({ "_id": 10 })];
        assert_eq!(
            newest_cursor(&query, &untimed),
            Some(CursorPosition::new(None, "10").with_id_kind(CursorIdKind::Number))
        );
        let empty: [JsonValue; 0] = [];
        assert_eq!(newest_cursor(&query, &empty), None);
    }

    #[test]
    fn cursor_ties_break_by_external_id() {
        let query = SourceQuery::new(None, SourceFields::default(), 10);
        let documents = ["B", "C", "A"].map(|id| json!({ "_id": id, "createdAt": "2026-03-01T10:05:00Z" }));
        assert_eq!(newest_cursor(&query, &documents), Some(text_cursor(Some(at(10, 5)), "C")));
    }

    #[test]
    fn cursor_reads_only_the_query_fields() {
        let query = SourceQuery::new(None, SourceFields::default(), 10);
        let documents = [
            json!({ "_id": "1", "dateCreated": "2026-03-01T12:00:00Z" }),
            json!({ "_id": "2", "createdAt": "2026-03-01T10:00:00Z" }),
            json!({ "ticketGroupId": 991, "createdAt": "2026-03-01T11:00:00Z" }),
        ];
        assert_eq!(newest_cursor(&query, &documents), Some(text_cursor(Some(at(10, 0)), "2")));
    }

    #[tokio::test]
    async fn fallback_fields_never_push_the_cursor_past_unfetched_records() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSaleSource::new(
            "sales",
            vec![
                json!({ "_id": "1", "dateCreated": "2026-03-01T12:00:00Z" }),
                json!({ "_id": "2", "createdAt": "2026-03-01T10:00:00Z" }),
                json!({ "_id": "3", "createdAt": "2026-03-01T11:00:00Z" }),
                json!({ "ticketGroupId": 991, "createdAt": "2026-03-01T11:00:00Z" }),
                json!({ "_id": "65f0c0ffee0000000000abcd", "createdAt": "2026-03-01T11:00:00Z" }),
            ],
        ));
        let settings = IngestSettings { batch_size: 2, ..IngestSettings::default() };
        let orch = IngestionOrchestrator::new(IngestContext::new(source, store.clone(), settings));

        for _ in 0..5 {
            completed(orch.run_once().await);
        }

        let mut ids = store
            .sales()
            .await
            .into_iter()
            .map(|s| s.external_id)
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3", "65f0c0ffee0000000000abcd", "991"]);
        assert_eq!(
            stored_cursor(&store).await,
            Some(text_cursor(Some(at(11, 0)), "65f0c0ffee0000000000abcd"))
        );
    }

    #[test]
    fn dedup_keeps_first_position() {
        let mut later = sale("A", Some(at(11, 0)));
        later.price = Some(2.0);
        let deduped = dedup_last_write_wins(vec![sale("A", None), sale("B", None), later]);
        let ids = deduped.iter().map(|r| r.external_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(deduped[0].price, Some(2.0));
    }

    #[tokio::test]
    async fn operator_fields_survive_reingestion() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSaleSource::new(
            "sales",
            vec![json!({ "_id": "A", "createdAt": "2026-03-01T10:00:00Z", "price": 10, "status": "SOLD" })],
        ));
        let orch = orchestrator(source.clone(), store.clone());
        completed(orch.run_once().await);

        let owner = store.insert_user("Ops", None).await;
        let row = store.sale_by_external_id("A").await.unwrap();
        let row = store
            .update_status(
                row.id,
                &StatusUpdate {
                    status: SaleStatus::Problem,
                    delayed_until: None,
                    problem_reason: Some("card declined".into()),
                    expected_updated_at: row.updated_at,
                },
            )
            .await
            .unwrap();
        store.assign_owner(row.id, Some(owner.id)).await.unwrap();

        source
            .replace(
                "_id",
                "A",
                json!({ "_id": "A", "createdAt": "2026-03-01T10:00:00Z", "price": 15, "status": "SOLD" }),
            )
            .await;
        CursorStore::set(store.as_ref(), "sales_ingestion_cursor", "").await.unwrap();
        let summary = completed(orch.run_once().await);
        assert_eq!(summary.counts.updated, 1);

        let row = store.sale_by_external_id("A").await.unwrap();
        assert_eq!(row.status, SaleStatus::Problem);
        assert_eq!(row.problem_reason.as_deref(), Some("card declined"));
        assert_eq!(row.filled_by, Some(owner.id));
        assert_eq!(row.price, Some(15.0));
    }

    struct FlakyCursors {
        inner: Arc<MemoryStore>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl CursorStore for FlakyCursors {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            CursorStore::get(self.inner.as_ref(), key).await
        }

        async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::InvalidInput("cursor write refused".into()));
            }
            CursorStore::set(self.inner.as_ref(), key, value).await
        }
    }

    #[tokio::test]
    async fn failed_cursor_write_refetches_without_double_inserting() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSaleSource::new("sales", scenario_documents()));
        let ctx = IngestContext {
            source,
            sales: store.clone(),
            cursors: Arc::new(FlakyCursors {
                inner: store.clone(),
                failures_left: AtomicUsize::new(1),
            }),
            ledger: store.clone(),
            settings: IngestSettings::default(),
        };
        let orch = IngestionOrchestrator::new(ctx);

        match orch.run_once().await {
            RunOutcome::Failed { run_id, message } => {
                assert!(run_id.is_some());
                assert!(message.contains("cursor write refused"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(store.sales().await.len(), 2);
        assert_eq!(stored_cursor(&store).await, None);

        let retry = completed(orch.run_once().await);
        assert_eq!(
            retry.counts,
            RunCounts { processed: 2, inserted: 0, updated: 2, rejected: 1 }
        );
        assert_eq!(store.sales().await.len(), 2);

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[1].status, RunStatus::Failure);
        assert!(runs[1].error_message.as_deref().unwrap().contains("cursor write refused"));
    }

    struct BrokenSource;

    #[async_trait]
    impl SaleSource for BrokenSource {
        fn source_id(&self) -> &str {
            "broken"
        }

        async fn fetch_batch(&self, _query: &SourceQuery) -> Result<Vec<JsonValue>, SourceError> {
            Err(SourceError::Message("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn source_failure_is_contained_in_the_run() {
        let store = Arc::new(MemoryStore::new());
        CursorStore::set(store.as_ref(), "sales_ingestion_cursor", "ext-1").await.unwrap();
        let orch = orchestrator(Arc::new(BrokenSource), store.clone());

        let outcome = orch.run_once().await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert!(!orch.is_running());
        assert_eq!(
            CursorStore::get(store.as_ref(), "sales_ingestion_cursor").await.unwrap().as_deref(),
            Some("ext-1")
        );
        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failure);
        assert!(runs[0].error_message.as_deref().unwrap().contains("connection reset"));
    }

    #[derive(Default)]
    struct GatedSource {
        entered: Notify,
        release: Notify,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl SaleSource for GatedSource {
        fn source_id(&self) -> &str {
            "gated"
        }

        async fn fetch_batch(&self, _query: &SourceQuery) -> Result<Vec<JsonValue>, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec![json!({ "_id": "A", "createdAt": "2026-03-01T10:00:00Z" })])
        }
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(GatedSource::default());
        let orch = Arc::new(orchestrator(source.clone(), store.clone()));

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { orch.run_once().await }
        });
        source.entered.notified().await;
        assert!(orch.is_running());
        assert_eq!(orch.run_once().await, RunOutcome::Skipped);

        source.release.notify_one();
        completed(first.await.unwrap());
        orch.wait_idle().await;

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutting_down_skips_the_fetch_but_closes_the_run() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(GatedSource::default());
        let orch = orchestrator(source.clone(), store.clone());
        orch.begin_shutdown();

        let summary = completed(orch.run_once().await);
        assert_eq!(summary.counts, RunCounts::default());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(store.recent_runs(1).await.unwrap()[0].status, RunStatus::Success);
    }
}
