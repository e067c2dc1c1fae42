//! Postgres backend over the existing `sales` / `ingestion_state` /
//! `sale_ingestion_runs` schema.

use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use triage_core::{
    Comment, IngestionRun, NormalizedSale, RunCounts, RunStatus, Sale, SaleDetail, SaleStatus,
    StatusUpdate, Tag, DEFAULT_INGEST_STATUS,
};
use uuid::Uuid;

use crate::{
    normalize_comment_body, normalize_problem_reason, normalize_tag_name, validate_batch,
    CursorStore, RunLedger, SaleOperations, SaleStore, StoreError, StoreResult, UpsertOutcome,
};

const SALE_COLUMNS: &str = r#"
    id, external_id, listing_id, event_id, quantity, price, currency, buyer_email,
    raw_payload, status, delayed_until, problem_reason, filled_by,
    created_at, updated_at, source_created_at, source_updated_at, sync_state
"#;

const RUN_COLUMNS: &str = r#"
    id, started_at, finished_at, status,
    processed_count, inserted_count, updated_count, rejected_count, error_message
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_sale(&self, sale_id: Uuid) -> StoreResult<Sale> {
        let row = sqlx::query(&format!("SELECT {SALE_COLUMNS} FROM sales WHERE id = $1"))
            .bind(sale_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::SaleNotFound(sale_id))?;
        sale_from_row(&row)
    }

    async fn ensure_user(&self, user_id: Uuid) -> StoreResult<()> {
        let found = sqlx::query("SELECT 1 FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        found.map(|_| ()).ok_or(StoreError::UserNotFound(user_id))
    }

    async fn close_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        counts: RunCounts,
        message: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sale_ingestion_runs
               SET status = $2,
                   finished_at = NOW(),
                   processed_count = $3,
                   inserted_count = $4,
                   updated_count = $5,
                   rejected_count = $6,
                   error_message = $7
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(count_to_db(counts.processed))
        .bind(count_to_db(counts.inserted))
        .bind(count_to_db(counts.updated))
        .bind(count_to_db(counts.rejected))
        .bind(message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let exists = sqlx::query("SELECT 1 FROM sale_ingestion_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StoreError::RunAlreadyClosed(run_id)),
            None => Err(StoreError::RunNotFound(run_id)),
        }
    }
}

fn count_to_db(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn count_from_db(count: i64) -> u64 {
    u64::try_from(count).unwrap_or_default()
}

fn sale_from_row(row: &PgRow) -> StoreResult<Sale> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<SaleStatus>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(Sale {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        listing_id: row.try_get("listing_id")?,
        event_id: row.try_get("event_id")?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        buyer_email: row.try_get("buyer_email")?,
        raw: row.try_get("raw_payload")?,
        status,
        delayed_until: row.try_get("delayed_until")?,
        problem_reason: row.try_get("problem_reason")?,
        filled_by: row.try_get("filled_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        source_created_at: row.try_get("source_created_at")?,
        source_updated_at: row.try_get("source_updated_at")?,
        sync_state: row.try_get("sync_state")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<IngestionRun> {
    let status: String = row.try_get("status")?;
    let status = RunStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown run status `{status}`")))?;
    Ok(IngestionRun {
        id: row.try_get("id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status,
        counts: RunCounts {
            processed: count_from_db(row.try_get("processed_count")?),
            inserted: count_from_db(row.try_get("inserted_count")?),
            updated: count_from_db(row.try_get("updated_count")?),
            rejected: count_from_db(row.try_get("rejected_count")?),
        },
        error_message: row.try_get("error_message")?,
    })
}

async fn existing_ids_in(
    tx: &mut Transaction<'_, Postgres>,
    external_ids: &[String],
) -> StoreResult<HashSet<String>> {
    let rows = sqlx::query("SELECT external_id FROM sales WHERE external_id = ANY($1)")
        .bind(external_ids)
        .fetch_all(&mut **tx)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("external_id").map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl CursorStore for PgStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM ingestion_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_state (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn begin(&self) -> StoreResult<Uuid> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO sale_ingestion_runs
                (id, started_at, status, processed_count, inserted_count, updated_count, rejected_count)
            VALUES ($1, NOW(), 'running', 0, 0, 0, 0)
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn complete_success(&self, run_id: Uuid, counts: RunCounts) -> StoreResult<()> {
        self.close_run(run_id, RunStatus::Success, counts, None).await
    }

    async fn complete_failure(&self, run_id: Uuid, message: &str) -> StoreResult<()> {
        self.close_run(run_id, RunStatus::Failure, RunCounts::default(), Some(message))
            .await
    }

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<IngestionRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sale_ingestion_runs ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(count_to_db(limit as u64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}

#[async_trait]
impl SaleStore for PgStore {
    async fn existing_external_ids(&self, external_ids: &[String]) -> StoreResult<HashSet<String>> {
        if external_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut tx = self.pool.begin().await?;
        let found = existing_ids_in(&mut tx, external_ids).await?;
        tx.commit().await?;
        Ok(found)
    }

    async fn upsert(&self, records: &[NormalizedSale], sync_tag: &str) -> StoreResult<UpsertOutcome> {
        validate_batch(records)?;
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let mut tx = self.pool.begin().await?;
        let ids = records
            .iter()
            .map(|r| r.external_id.clone())
            .collect::<Vec<_>>();
        let mut present = existing_ids_in(&mut tx, &ids).await?;

        let mut outcome = UpsertOutcome::default();
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO sales (
                    id, external_id, listing_id, event_id, quantity, price, currency,
                    buyer_email, raw_payload, status, source_created_at, source_updated_at,
                    sync_state, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
                ON CONFLICT (external_id) DO UPDATE
                   SET listing_id = EXCLUDED.listing_id,
                       event_id = EXCLUDED.event_id,
                       quantity = EXCLUDED.quantity,
                       price = EXCLUDED.price,
                       currency = EXCLUDED.currency,
                       buyer_email = EXCLUDED.buyer_email,
                       raw_payload = EXCLUDED.raw_payload,
                       source_created_at = EXCLUDED.source_created_at,
                       source_updated_at = EXCLUDED.source_updated_at,
                       sync_state = EXCLUDED.sync_state,
                       updated_at = NOW(),
                       status = COALESCE(sales.status, EXCLUDED.status),
                       delayed_until = COALESCE(sales.delayed_until, EXCLUDED.delayed_until),
                       problem_reason = COALESCE(sales.problem_reason, EXCLUDED.problem_reason),
                       filled_by = COALESCE(sales.filled_by, EXCLUDED.filled_by)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&record.external_id)
            .bind(&record.listing_id)
            .bind(&record.event_id)
            .bind(record.quantity)
            .bind(record.price)
            .bind(&record.currency)
            .bind(&record.buyer_email)
            .bind(&record.raw)
            .bind(record.status.unwrap_or(DEFAULT_INGEST_STATUS).as_str())
            .bind(record.source_created_at)
            .bind(record.source_updated_at)
            .bind(sync_tag)
            .execute(&mut *tx)
            .await?;

            outcome.processed += 1;
            if present.insert(record.external_id.clone()) {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl SaleOperations for PgStore {
    async fn sale_detail(&self, sale_id: Uuid) -> StoreResult<SaleDetail> {
        let sale = self.fetch_sale(sale_id).await?;

        let tag_rows = sqlx::query(
            r#"
            SELECT t.id, t.name
              FROM tags t
              JOIN sale_tags st ON st.tag_id = t.id
             WHERE st.sale_id = $1
             ORDER BY t.name
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        let mut tags = Vec::with_capacity(tag_rows.len());
        for row in tag_rows {
            tags.push(Tag {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }

        let comment_rows = sqlx::query(
            r#"
            SELECT id, sale_id, author_id, body, created_at
              FROM sale_comments
             WHERE sale_id = $1
             ORDER BY created_at, id
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        let mut comments = Vec::with_capacity(comment_rows.len());
        for row in comment_rows {
            comments.push(Comment {
                id: row.try_get("id")?,
                sale_id: row.try_get("sale_id")?,
                author_id: row.try_get("author_id")?,
                body: row.try_get("body")?,
                created_at: row.try_get("created_at")?,
            });
        }

        Ok(SaleDetail {
            sale,
            tags,
            comments,
        })
    }

    async fn update_status(&self, sale_id: Uuid, update: &StatusUpdate) -> StoreResult<Sale> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sales
               SET status = $2,
                   delayed_until = $3,
                   problem_reason = $4,
                   updated_at = NOW()
             WHERE id = $1
               AND updated_at = $5
            RETURNING {SALE_COLUMNS}
            "#
        ))
        .bind(sale_id)
        .bind(update.status.as_str())
        .bind(update.delayed_until)
        .bind(normalize_problem_reason(update.problem_reason.as_deref()))
        .bind(update.expected_updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return sale_from_row(&row);
        }
        let current = sqlx::query("SELECT updated_at FROM sales WHERE id = $1")
            .bind(sale_id)
            .fetch_optional(&self.pool)
            .await?;
        match current {
            Some(row) => {
                let current_updated_at: DateTime<Utc> = row.try_get("updated_at")?;
                Err(StoreError::StaleEdit {
                    sale_id,
                    current_updated_at,
                })
            }
            None => Err(StoreError::SaleNotFound(sale_id)),
        }
    }

    async fn add_tag(&self, sale_id: Uuid, name: &str) -> StoreResult<Tag> {
        let name = normalize_tag_name(name)?;
        self.fetch_sale(sale_id).await?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO tags (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE
               SET name = EXCLUDED.name
            RETURNING id, name
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&name)
        .fetch_one(&mut *tx)
        .await?;
        let tag = Tag {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        };
        sqlx::query(
            "INSERT INTO sale_tags (sale_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(sale_id)
        .bind(tag.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(tag)
    }

    async fn remove_tag(&self, sale_id: Uuid, name: &str) -> StoreResult<bool> {
        self.fetch_sale(sale_id).await?;
        let result = sqlx::query(
            r#"
            DELETE FROM sale_tags st
             USING tags t
             WHERE st.tag_id = t.id
               AND st.sale_id = $1
               AND t.name = $2
            "#,
        )
        .bind(sale_id)
        .bind(name.trim())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_comment(&self, sale_id: Uuid, author_id: Uuid, body: &str) -> StoreResult<Comment> {
        let body = normalize_comment_body(body)?;
        self.fetch_sale(sale_id).await?;
        self.ensure_user(author_id).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO sale_comments (id, sale_id, author_id, body, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING id, sale_id, author_id, body, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(sale_id)
        .bind(author_id)
        .bind(&body)
        .fetch_one(&self.pool)
        .await?;
        Ok(Comment {
            id: row.try_get("id")?,
            sale_id: row.try_get("sale_id")?,
            author_id: row.try_get("author_id")?,
            body: row.try_get("body")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn assign_owner(&self, sale_id: Uuid, owner: Option<Uuid>) -> StoreResult<Sale> {
        if let Some(user_id) = owner {
            self.ensure_user(user_id).await?;
        }
        let row = sqlx::query(&format!(
            r#"
            UPDATE sales
               SET filled_by = $2,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {SALE_COLUMNS}
            "#
        ))
        .bind(sale_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::SaleNotFound(sale_id))?;
        sale_from_row(&row)
    }
}
