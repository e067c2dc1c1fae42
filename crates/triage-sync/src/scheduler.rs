//! Periodic triggering of the ingestion orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::orchestrator::{IngestionOrchestrator, RunOutcome};

struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Fixed-interval polling loop: one pass on start, then one per interval.
pub struct IngestScheduler {
    orchestrator: Arc<IngestionOrchestrator>,
    interval: Duration,
    active: Mutex<Option<LoopHandle>>,
}

impl IngestScheduler {
    pub fn new(orchestrator: Arc<IngestionOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            active: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<IngestionOrchestrator> {
        &self.orchestrator
    }

    pub async fn is_started(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Starts the loop. Returns `false` if it was already running.
    pub async fn start(&self) -> bool {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return false;
        }
        self.orchestrator.clear_shutdown();
        let token = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            self.orchestrator.clone(),
            self.interval,
            token.clone(),
        ));
        info!(interval_secs = self.interval.as_secs(), "ingestion scheduler started");
        *active = Some(LoopHandle { token, task });
        true
    }

    /// Flags shutdown, cancels the loop and waits for any in-flight run.
    pub async fn stop(&self) {
        self.orchestrator.begin_shutdown();
        let handle = self.active.lock().await.take();
        if let Some(handle) = handle {
            handle.token.cancel();
            if let Err(err) = handle.task.await {
                error!(error = %err, "ingestion scheduler task ended abnormally");
            }
        }
        self.orchestrator.wait_idle().await;
        info!("ingestion scheduler stopped");
    }
}

async fn poll_loop(
    orchestrator: Arc<IngestionOrchestrator>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }
        log_outcome(&orchestrator.run_once().await);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

fn log_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Skipped => debug!("scheduled tick skipped"),
        RunOutcome::Completed(summary) => {
            debug!(run_id = %summary.run_id, processed = summary.counts.processed, "scheduled run done")
        }
        RunOutcome::Failed { run_id, message } => {
            debug!(run_id = ?run_id, error = %message, "scheduled run failed")
        }
    }
}

/// Cron-driven alternative to [`IngestScheduler`]. Overlapping ticks are
/// skipped by the orchestrator's run guard.
pub async fn build_cron_scheduler(
    orchestrator: Arc<IngestionOrchestrator>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            log_outcome(&orchestrator.run_once().await);
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
