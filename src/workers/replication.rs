/// Replication worker: copies stored blobs from the primary store to the
/// secondary replicas.
///
/// The attempt counter is stamped before the copy is tried, so a crash
/// mid-copy still counts against the budget on restart. A task whose
/// budget runs out stays unreplicated but is flagged for manual
/// attention with a DR event; the loop never drops work silently.
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::Result;
use crate::state::models::{DrEventType, ReplicationTask};
use crate::state::repository;

pub(crate) async fn run(engine: Arc<Engine>, cancel: CancellationToken) {
    let idle = Duration::from_secs(engine.config().replication_interval_secs);
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let processed = match run_once(&engine).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Replication cycle failed");
                0
            }
        };
        if processed > 0 {
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(idle) => {}
        }
    }
}

/// One polling cycle. Returns the number of tasks processed.
pub(crate) async fn run_once(engine: &Engine) -> Result<usize> {
    let max_attempts = engine.config().replication_max_attempts;
    let tasks = repository::pending_replication_tasks(
        engine.pool(),
        engine.config().replication_batch as i64,
        max_attempts,
    )
    .await?;

    let count = tasks.len();
    for task in tasks {
        replicate_task(engine, &task, max_attempts).await?;
    }
    Ok(count)
}

async fn replicate_task(engine: &Engine, task: &ReplicationTask, max_attempts: i64) -> Result<()> {
    repository::record_replication_attempt(engine.pool(), task.id).await?;
    let attempt = task.attempted + 1;

    let outcome = copy_to_secondary(engine, &task.locator).await;
    match outcome {
        Ok(()) => {
            repository::mark_replicated(engine.pool(), task.id).await?;
            tracing::info!(task_id = task.id, locator = task.locator, "Replicated");
        }
        Err(e) => {
            tracing::warn!(
                task_id = task.id,
                locator = task.locator,
                attempt,
                error = %e,
                "Replication attempt failed"
            );
            if attempt >= max_attempts {
                let entry = repository::get_file_entry_by_id(engine.pool(), task.file_entry_id)
                    .await?;
                engine
                    .record_event(
                        entry.map(|e| e.user_id),
                        DrEventType::ReplicationAttemptsExhausted,
                        &format!(
                            "task {} for {} failed {attempt} times: {e}",
                            task.id, task.locator
                        ),
                    )
                    .await?;
            }
        }
    }
    Ok(())
}

/// Fetch from the primary and write to the first secondary that accepts
/// the copy.
async fn copy_to_secondary(engine: &Engine, locator: &str) -> Result<()> {
    let secondaries = engine.secondaries();
    if secondaries.is_empty() {
        // Nothing to replicate to; the task is trivially satisfied.
        return Ok(());
    }

    let data = engine.primary().get(locator).await?;

    let mut last_err = None;
    for store in secondaries {
        match store.put(locator, &data).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(store = store.name(), locator, error = %e, "Replica write failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        crate::error::VaultError::Upload(format!("no secondary accepted {locator}"))
    }))
}
