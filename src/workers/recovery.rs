/// Crash-recovery worker: replays queued uploads through the normal
/// backup pipeline.
///
/// The pending-upload queue is at-least-once: rows are popped before
/// processing and re-queued on failure, so an item can be retried but
/// never lost. Items that keep failing are abandoned loudly with a DR
/// event, never dropped in silence.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::{Result, VaultError};
use crate::state::models::DrEventType;
use crate::state::repository;

pub(crate) async fn run(engine: Arc<Engine>, cancel: CancellationToken) {
    let idle = Duration::from_secs(engine.config().recovery_interval_secs);
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let processed = match run_once(&engine).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Recovery cycle failed");
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

/// One polling cycle. Returns the number of queued uploads processed.
pub(crate) async fn run_once(engine: &Engine) -> Result<usize> {
    let max_attempts = engine.config().recovery_max_attempts;
    let items =
        repository::pop_pending_uploads(engine.pool(), engine.config().recovery_batch as i64)
            .await?;

    let count = items.len();
    for item in items {
        if item.attempts >= max_attempts {
            let detail = format!(
                "{} ({} attempts) abandoned: {}",
                item.filename, item.attempts, item.local_path
            );
            repository::add_audit(
                engine.pool(),
                Some(item.user_id),
                "pending_upload_abandoned",
                Some(&detail),
            )
            .await?;
            engine
                .record_event(Some(item.user_id), DrEventType::PendingUploadAbandoned, &detail)
                .await?;
            continue;
        }

        // The replay carries its attempt count into the pipeline, so a
        // renewed upload failure re-queues this exact obligation with the
        // incremented counter and an interleaved foreground failure keeps
        // its own fresh row.
        match engine
            .backup_file_inner(
                item.user_id,
                Path::new(&item.local_path),
                None,
                item.attempts + 1,
            )
            .await
        {
            Ok(entry) => {
                tracing::info!(
                    user_id = item.user_id,
                    filename = item.filename,
                    version = entry.version,
                    "Recovered queued upload"
                );
            }
            Err(VaultError::Upload(e)) => {
                tracing::warn!(
                    user_id = item.user_id,
                    filename = item.filename,
                    attempts = item.attempts + 1,
                    error = %e,
                    "Replay failed, obligation re-queued"
                );
            }
            Err(e) => {
                let detail = format!("{}: {e}", item.local_path);
                repository::add_pending_upload(
                    engine.pool(),
                    item.user_id,
                    &item.local_path,
                    &item.filename,
                    item.attempts + 1,
                )
                .await?;
                engine
                    .record_event(Some(item.user_id), DrEventType::RecoveryUploadFailed, &detail)
                    .await?;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, write_source_file};

    #[tokio::test]
    async fn test_queued_upload_replayed_exactly_once() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"data");

        h.primary.set_fail_puts(true);
        h.engine.backup_file(user.id, &src).await.unwrap_err();
        assert_eq!(
            repository::pending_upload_count(h.engine.pool(), None).await.unwrap(),
            1
        );

        h.primary.set_fail_puts(false);
        assert_eq!(run_once(&h.engine).await.unwrap(), 1);

        let entries = repository::get_file_entries(h.engine.pool(), user.id, Some("doc.txt"))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, 1);

        // Queue drained; a second cycle registers nothing new.
        assert_eq!(run_once(&h.engine).await.unwrap(), 0);
        assert_eq!(
            repository::pending_upload_count(h.engine.pool(), None).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_still_failing_upload_requeued_with_attempts() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"data");

        h.primary.set_fail_puts(true);
        h.engine.backup_file(user.id, &src).await.unwrap_err();

        // Primary still down: the replay fails and the obligation survives.
        assert_eq!(run_once(&h.engine).await.unwrap(), 1);
        let queued = repository::pop_pending_uploads(h.engine.pool(), 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_attempt_counts_stay_with_their_rows() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"data");

        h.primary.set_fail_puts(true);
        h.engine.backup_file(user.id, &src).await.unwrap_err();

        // Replay fails too (row re-queued with attempts 1); a foreground
        // failure for the same file then queues its own fresh obligation.
        assert_eq!(run_once(&h.engine).await.unwrap(), 1);
        h.engine.backup_file(user.id, &src).await.unwrap_err();

        let mut attempts: Vec<i64> = repository::pop_pending_uploads(h.engine.pool(), 10)
            .await
            .unwrap()
            .iter()
            .map(|item| item.attempts)
            .collect();
        attempts.sort();
        assert_eq!(attempts, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_vanished_source_requeued_and_flagged() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"data");

        h.primary.set_fail_puts(true);
        h.engine.backup_file(user.id, &src).await.unwrap_err();
        h.primary.set_fail_puts(false);
        std::fs::remove_file(&src).unwrap();

        assert_eq!(run_once(&h.engine).await.unwrap(), 1);

        let events = repository::recent_dr_events(h.engine.pool(), Some(user.id), 10)
            .await
            .unwrap();
        assert_eq!(events[0].event_type, DrEventType::RecoveryUploadFailed);
        let queued = repository::pop_pending_uploads(h.engine.pool(), 10).await.unwrap();
        assert_eq!(queued[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_item_abandoned_with_event() {
        let h = testutil::test_harness_with(crate::config::EngineConfig {
            recovery_max_attempts: 2,
            ..crate::config::EngineConfig::default()
        })
        .await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;

        repository::add_pending_upload(h.engine.pool(), user.id, "/gone/doc.txt", "doc.txt", 2)
            .await
            .unwrap();

        assert_eq!(run_once(&h.engine).await.unwrap(), 1);
        assert_eq!(
            repository::pending_upload_count(h.engine.pool(), None).await.unwrap(),
            0
        );
        let events = repository::recent_dr_events(h.engine.pool(), Some(user.id), 10)
            .await
            .unwrap();
        assert_eq!(events[0].event_type, DrEventType::PendingUploadAbandoned);
    }
}
