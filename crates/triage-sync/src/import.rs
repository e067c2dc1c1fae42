//! One-shot file import: the ingestion mapper and upsert without cursor or
//! ledger bookkeeping.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;
use triage_adapters::load_documents;
use triage_storage::SaleStore;

use crate::orchestrator::{classify_existing, prepare_batch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub sync_tag: String,
    pub dry_run: bool,
    pub documents: u64,
    pub rejected: u64,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
}

pub fn import_tag(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    format!("import:{name}")
}

pub async fn import_documents(
    store: &dyn SaleStore,
    documents: &[JsonValue],
    sync_tag: &str,
    dry_run: bool,
) -> Result<ImportSummary> {
    let batch = prepare_batch(documents);
    let (inserted, updated) = classify_existing(store, &batch.records)
        .await
        .context("checking existing sales")?;
    if !dry_run && !batch.records.is_empty() {
        store
            .upsert(&batch.records, sync_tag)
            .await
            .context("upserting imported sales")?;
    }
    let summary = ImportSummary {
        sync_tag: sync_tag.to_string(),
        dry_run,
        documents: documents.len() as u64,
        rejected: batch.rejected,
        processed: batch.records.len() as u64,
        inserted,
        updated,
    };
    info!(
        tag = %summary.sync_tag,
        dry_run,
        processed = summary.processed,
        inserted,
        updated,
        rejected = summary.rejected,
        "import finished"
    );
    Ok(summary)
}

pub async fn import_file(store: &dyn SaleStore, path: &Path, dry_run: bool) -> Result<ImportSummary> {
    let documents = load_documents(path)?;
    import_documents(store, &documents, &import_tag(path), dry_run).await
}
