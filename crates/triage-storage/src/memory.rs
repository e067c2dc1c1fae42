//! In-process store with the same semantics as the Postgres backend.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use tokio::sync::Mutex;
use triage_core::{
    Comment, IngestionRun, NormalizedSale, RunCounts, RunStatus, Sale, SaleDetail, StatusUpdate,
    Tag, User, DEFAULT_INGEST_STATUS,
};
use uuid::Uuid;

use crate::{
    normalize_comment_body, normalize_problem_reason, normalize_tag_name, validate_batch,
    CursorStore, RunLedger, SaleOperations, SaleStore, StoreError, StoreResult, UpsertOutcome,
};

#[derive(Debug, Default)]
struct MemoryState {
    cursors: HashMap<String, String>,
    runs: Vec<IngestionRun>,
    // keyed by external id
    sales: BTreeMap<String, Sale>,
    tags: Vec<Tag>,
    sale_tags: HashSet<(Uuid, Uuid)>,
    comments: Vec<Comment>,
    users: HashMap<Uuid, User>,
}

impl MemoryState {
    fn sale_mut(&mut self, sale_id: Uuid) -> StoreResult<&mut Sale> {
        self.sales
            .values_mut()
            .find(|s| s.id == sale_id)
            .ok_or(StoreError::SaleNotFound(sale_id))
    }

    fn sale(&self, sale_id: Uuid) -> StoreResult<&Sale> {
        self.sales
            .values()
            .find(|s| s.id == sale_id)
            .ok_or(StoreError::SaleNotFound(sale_id))
    }

    fn close_run(
        &mut self,
        run_id: Uuid,
        status: RunStatus,
        counts: RunCounts,
        message: Option<&str>,
    ) -> StoreResult<()> {
        let run = self
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            return Err(StoreError::RunAlreadyClosed(run_id));
        }
        run.status = status;
        run.counts = counts;
        run.finished_at = Some(now());
        run.error_message = message.map(ToString::to_string);
        Ok(())
    }
}

/// Timestamps are kept at microsecond precision, like `timestamptz`.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Next `updated_at` for a row; strictly increases so optimistic checks
/// cannot be fooled by two edits landing in the same microsecond.
fn bump(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, display_name: &str, email: Option<&str>) -> User {
        let user = User {
            id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            email: email.map(ToString::to_string),
        };
        self.state.lock().await.users.insert(user.id, user.clone());
        user
    }

    pub async fn sales(&self) -> Vec<Sale> {
        self.state.lock().await.sales.values().cloned().collect()
    }

    pub async fn sale_by_external_id(&self, external_id: &str) -> Option<Sale> {
        self.state.lock().await.sales.get(external_id).cloned()
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.lock().await.cursors.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .cursors
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn begin(&self) -> StoreResult<Uuid> {
        let run = IngestionRun {
            id: Uuid::new_v4(),
            started_at: now(),
            finished_at: None,
            status: RunStatus::Running,
            counts: RunCounts::default(),
            error_message: None,
        };
        let id = run.id;
        self.state.lock().await.runs.push(run);
        Ok(id)
    }

    async fn complete_success(&self, run_id: Uuid, counts: RunCounts) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .close_run(run_id, RunStatus::Success, counts, None)
    }

    async fn complete_failure(&self, run_id: Uuid, message: &str) -> StoreResult<()> {
        self.state.lock().await.close_run(
            run_id,
            RunStatus::Failure,
            RunCounts::default(),
            Some(message),
        )
    }

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<IngestionRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl SaleStore for MemoryStore {
    async fn existing_external_ids(&self, external_ids: &[String]) -> StoreResult<HashSet<String>> {
        let state = self.state.lock().await;
        Ok(external_ids
            .iter()
            .filter(|id| state.sales.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn upsert(&self, records: &[NormalizedSale], sync_tag: &str) -> StoreResult<UpsertOutcome> {
        validate_batch(records)?;

        let mut state = self.state.lock().await;
        let mut outcome = UpsertOutcome::default();
        for record in records {
            outcome.processed += 1;
            match state.sales.get_mut(&record.external_id) {
                Some(existing) => {
                    existing.listing_id = record.listing_id.clone();
                    existing.event_id = record.event_id.clone();
                    existing.quantity = record.quantity;
                    existing.price = record.price;
                    existing.currency = record.currency.clone();
                    existing.buyer_email = record.buyer_email.clone();
                    existing.raw = record.raw.clone();
                    existing.source_created_at = record.source_created_at;
                    existing.source_updated_at = record.source_updated_at;
                    existing.sync_state = Some(sync_tag.to_string());
                    existing.updated_at = bump(existing.updated_at);
                    outcome.updated += 1;
                }
                None => {
                    let ts = now();
                    state.sales.insert(
                        record.external_id.clone(),
                        Sale {
                            id: Uuid::new_v4(),
                            external_id: record.external_id.clone(),
                            listing_id: record.listing_id.clone(),
                            event_id: record.event_id.clone(),
                            quantity: record.quantity,
                            price: record.price,
                            currency: record.currency.clone(),
                            buyer_email: record.buyer_email.clone(),
                            raw: record.raw.clone(),
                            status: record.status.unwrap_or(DEFAULT_INGEST_STATUS),
                            delayed_until: None,
                            problem_reason: None,
                            filled_by: None,
                            created_at: ts,
                            updated_at: ts,
                            source_created_at: record.source_created_at,
                            source_updated_at: record.source_updated_at,
                            sync_state: Some(sync_tag.to_string()),
                        },
                    );
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl SaleOperations for MemoryStore {
    async fn sale_detail(&self, sale_id: Uuid) -> StoreResult<SaleDetail> {
        let state = self.state.lock().await;
        let sale = state.sale(sale_id)?.clone();
        let mut tags = state
            .tags
            .iter()
            .filter(|t| state.sale_tags.contains(&(sale_id, t.id)))
            .cloned()
            .collect::<Vec<_>>();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        let comments = state
            .comments
            .iter()
            .filter(|c| c.sale_id == sale_id)
            .cloned()
            .collect();
        Ok(SaleDetail {
            sale,
            tags,
            comments,
        })
    }

    async fn update_status(&self, sale_id: Uuid, update: &StatusUpdate) -> StoreResult<Sale> {
        let mut state = self.state.lock().await;
        let sale = state.sale_mut(sale_id)?;
        if sale.updated_at != update.expected_updated_at {
            return Err(StoreError::StaleEdit {
                sale_id,
                current_updated_at: sale.updated_at,
            });
        }
        sale.status = update.status;
        sale.delayed_until = update.delayed_until;
        sale.problem_reason = normalize_problem_reason(update.problem_reason.as_deref());
        sale.updated_at = bump(sale.updated_at);
        Ok(sale.clone())
    }

    async fn add_tag(&self, sale_id: Uuid, name: &str) -> StoreResult<Tag> {
        let name = normalize_tag_name(name)?;
        let mut state = self.state.lock().await;
        state.sale(sale_id)?;
        let tag = match state.tags.iter().find(|t| t.name == name) {
            Some(tag) => tag.clone(),
            None => {
                let tag = Tag {
                    id: Uuid::new_v4(),
                    name,
                };
                state.tags.push(tag.clone());
                tag
            }
        };
        state.sale_tags.insert((sale_id, tag.id));
        Ok(tag)
    }

    async fn remove_tag(&self, sale_id: Uuid, name: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.sale(sale_id)?;
        let Some(tag_id) = state.tags.iter().find(|t| t.name == name.trim()).map(|t| t.id) else {
            return Ok(false);
        };
        Ok(state.sale_tags.remove(&(sale_id, tag_id)))
    }

    async fn add_comment(&self, sale_id: Uuid, author_id: Uuid, body: &str) -> StoreResult<Comment> {
        let body = normalize_comment_body(body)?;
        let mut state = self.state.lock().await;
        state.sale(sale_id)?;
        if !state.users.contains_key(&author_id) {
            return Err(StoreError::UserNotFound(author_id));
        }
        let comment = Comment {
            id: Uuid::new_v4(),
            sale_id,
            author_id,
            body,
            created_at: now(),
        };
        state.comments.push(comment.clone());
        Ok(comment)
    }

    async fn assign_owner(&self, sale_id: Uuid, owner: Option<Uuid>) -> StoreResult<Sale> {
        let mut state = self.state.lock().await;
        if let Some(user_id) = owner {
            if !state.users.contains_key(&user_id) {
                return Err(StoreError::UserNotFound(user_id));
            }
        }
        let sale = state.sale_mut(sale_id)?;
        sale.filled_by = owner;
        sale.updated_at = bump(sale.updated_at);
        Ok(sale.clone())
    }
}
