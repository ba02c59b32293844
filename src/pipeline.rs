/// Backup write path: encrypt, store, register, replicate, prune.
///
/// Failure ordering is the core guarantee: the primary-store write happens
/// before the metadata insert, so a crash between the two leaves an orphan
/// blob (harmless, versions are never reused) and never a metadata row
/// pointing at nothing.
use std::path::{Path, PathBuf};

use crate::engine::Engine;
use crate::error::{Result, VaultError};
use crate::state::models::{DrEventType, FileEntry};
use crate::state::repository;
use crate::storage::blob_locator;
use crate::crypto::hash;

/// Filesystem change kinds fed in by an external watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// Outcome of a folder backup. Per-file failures never abort the batch.
#[derive(Debug)]
pub struct BackupBatchReport {
    pub snapshot_id: i64,
    pub backed_up: Vec<FileEntry>,
    pub failed: Vec<(PathBuf, String)>,
}

impl Engine {
    /// Back up one file: a new immutable encrypted version in the primary
    /// store plus a registered file entry, replication task, auto snapshot
    /// and retention pruning.
    pub async fn backup_file(&self, user_id: i64, source_path: &Path) -> Result<FileEntry> {
        self.backup_file_inner(user_id, source_path, None, 0).await
    }

    /// Shared write path. With `batch_snapshot` set the entry joins that
    /// snapshot instead of minting a per-file one; `requeue_attempts` is
    /// the attempt count stamped on the pending-upload row if the primary
    /// write fails (non-zero when replaying from the recovery queue).
    pub(crate) async fn backup_file_inner(
        &self,
        user_id: i64,
        source_path: &Path,
        batch_snapshot: Option<i64>,
        requeue_attempts: i64,
    ) -> Result<FileEntry> {
        repository::require_user(self.pool(), user_id).await?;

        let filename = source_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| VaultError::NotFound(format!("file name in {}", source_path.display())))?;

        let plaintext = match tokio::fs::read(source_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let msg = format!("source not found: {}", source_path.display());
                repository::add_audit(self.pool(), Some(user_id), "backup_failed", Some(&msg))
                    .await?;
                return Err(VaultError::NotFound(msg));
            }
            Err(e) => return Err(e.into()),
        };

        // Version allocation through pruning runs under the per-file lock;
        // two concurrent backups of the same file serialize here.
        let lock = self.file_locks.for_file(user_id, &filename);
        let _guard = lock.lock().await;

        let version = repository::next_version(self.pool(), user_id, &filename).await?;
        let locator = blob_locator(user_id, &filename, version);

        let ciphertext = self.cipher().encrypt(&plaintext)?;
        let checksum = hash::checksum_hex(&ciphertext);

        if let Err(e) = self.primary().put(&locator, &ciphertext).await {
            let detail = format!("{filename} v{version} upload failed: {e}");
            repository::add_pending_upload(
                self.pool(),
                user_id,
                &source_path.to_string_lossy(),
                &filename,
                requeue_attempts,
            )
            .await?;
            repository::add_audit(self.pool(), Some(user_id), "upload_failed", Some(&detail))
                .await?;
            self.record_event(Some(user_id), DrEventType::UploadFailed, &detail)
                .await?;
            return Err(e);
        }

        let entry = repository::insert_file_entry(
            self.pool(),
            user_id,
            &filename,
            version,
            &locator,
            &checksum,
        )
        .await?;

        // Every backup lands in a snapshot: the caller's batch snapshot
        // when one is in progress, otherwise a fresh per-file one.
        match batch_snapshot {
            Some(snapshot_id) => {
                repository::add_snapshot_entry(self.pool(), snapshot_id, entry.id).await?;
            }
            None => {
                let snapshot = repository::create_snapshot(
                    self.pool(),
                    user_id,
                    Some(&format!("{filename}-v{version}")),
                    Some(&format!("Auto snapshot for {filename} v{version}")),
                )
                .await?;
                repository::add_snapshot_entry(self.pool(), snapshot.id, entry.id).await?;
            }
        }

        repository::enqueue_replication(self.pool(), entry.id, &locator).await?;

        self.prune_file(user_id, &filename).await?;

        repository::add_audit(
            self.pool(),
            Some(user_id),
            "backup",
            Some(&format!("{filename} v{version} -> {locator}")),
        )
        .await?;
        tracing::info!(user_id, filename, version, locator, "Backup complete");

        self.notify_user(user_id, &format!("Backup complete: {filename} (v{version})"))
            .await;

        Ok(entry)
    }

    /// Soft-delete versions beyond the retention window and best-effort
    /// delete their blobs from every replica. Caller holds the file lock.
    async fn prune_file(&self, user_id: i64, filename: &str) -> Result<()> {
        let keep = self.config().retention as i64;
        let pruned = repository::prune_old_versions(self.pool(), user_id, filename, keep).await?;

        for (entry_id, locator) in pruned {
            if let Err(e) = self.primary().delete(&locator).await {
                let msg = format!("entry {entry_id}: failed to delete blob {locator}: {e}");
                tracing::warn!(user_id, locator, error = %e, "Prune blob deletion failed");
                repository::add_audit(self.pool(), Some(user_id), "prune_warning", Some(&msg))
                    .await?;
            }
            for store in self.secondaries() {
                if let Err(e) = store.delete(&locator).await {
                    tracing::warn!(
                        user_id,
                        locator,
                        store = store.name(),
                        error = %e,
                        "Prune replica deletion failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Back up every file under `dir` (recursively) into one snapshot.
    pub async fn backup_tree(
        &self,
        user_id: i64,
        dir: &Path,
        description: Option<&str>,
    ) -> Result<BackupBatchReport> {
        repository::require_user(self.pool(), user_id).await?;
        if !dir.is_dir() {
            return Err(VaultError::NotFound(format!("folder {}", dir.display())));
        }

        let snapshot = repository::create_snapshot(
            self.pool(),
            user_id,
            dir.file_name().and_then(|n| n.to_str()),
            Some(description.unwrap_or("Manual folder snapshot")),
        )
        .await?;

        let mut backed_up = Vec::new();
        let mut failed = Vec::new();

        for path in collect_files(dir)? {
            match self.backup_file_inner(user_id, &path, Some(snapshot.id), 0).await {
                Ok(entry) => backed_up.push(entry),
                Err(e) => {
                    repository::add_audit(
                        self.pool(),
                        Some(user_id),
                        "snapshot_file_failed",
                        Some(&format!("{}: {e}", path.display())),
                    )
                    .await?;
                    failed.push((path, e.to_string()));
                }
            }
        }

        repository::add_audit(
            self.pool(),
            Some(user_id),
            "snapshot_folder_complete",
            Some(&format!(
                "{}: {} backed up, {} failed",
                dir.display(),
                backed_up.len(),
                failed.len()
            )),
        )
        .await?;

        Ok(BackupBatchReport {
            snapshot_id: snapshot.id,
            backed_up,
            failed,
        })
    }

    /// Entry point for an external filesystem watcher. Never propagates
    /// per-event failures; everything is audited instead.
    pub async fn handle_file_event(
        &self,
        user_id: i64,
        path: &Path,
        kind: FileEventKind,
    ) -> Result<()> {
        match kind {
            FileEventKind::Created | FileEventKind::Modified => {
                if let Err(e) = self.backup_file(user_id, path).await {
                    repository::add_audit(
                        self.pool(),
                        Some(user_id),
                        "backup_error",
                        Some(&format!("{}: {e}", path.display())),
                    )
                    .await?;
                }
            }
            FileEventKind::Deleted => {
                let display = path.display().to_string();
                repository::add_audit(
                    self.pool(),
                    Some(user_id),
                    "file_deleted_event",
                    Some(&display),
                )
                .await?;
                self.notify_user(user_id, &format!("File deleted: {display}"))
                    .await;

                // A deletion with history on record is a restore candidate.
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if repository::latest_file_entry(self.pool(), user_id, name)
                        .await?
                        .is_some()
                    {
                        self.record_event(
                            Some(user_id),
                            DrEventType::AutoRestoreAttempt,
                            &format!("Deleted file has stored versions: {display}"),
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::BlobStore;
    use crate::testutil::{self, write_source_file};

    #[tokio::test]
    async fn test_backup_registers_version_and_stores_blob() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "notes.txt", b"plain contents");

        let entry = h.engine.backup_file(user.id, &src).await.unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.locator, "user_1/notes.txt.v1.enc");

        // Blob stored encrypted: present, and not the plaintext.
        let stored = h.primary.get(&entry.locator).await.unwrap();
        assert_ne!(stored, b"plain contents");
        assert!(crate::crypto::hash::verify_checksum(&stored, &entry.checksum));

        // Replication queued, auto snapshot created, notification sent.
        let tasks = repository::pending_replication_tasks(h.engine.pool(), 10, 10)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].locator, entry.locator);
        let snaps = repository::get_snapshots(h.engine.pool(), user.id, 10)
            .await
            .unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_versions_monotonic_and_retention_enforced() {
        let h = testutil::test_harness_with(EngineConfig {
            retention: 2,
            ..EngineConfig::default()
        })
        .await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"v1");

        for content in [&b"one"[..], b"two", b"three"] {
            std::fs::write(&src, content).unwrap();
            h.engine.backup_file(user.id, &src).await.unwrap();
        }

        // Versions 2 and 3 remain; version 1 soft-deleted and its blob gone.
        let visible = repository::get_file_entries(h.engine.pool(), user.id, Some("doc.txt"))
            .await
            .unwrap();
        assert_eq!(
            visible.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![3, 2]
        );
        assert!(!h.primary.exists("user_1/doc.txt.v1.enc").await.unwrap());
        assert!(h.primary.exists("user_1/doc.txt.v3.enc").await.unwrap());

        // The pruned slot is never reallocated.
        std::fs::write(&src, b"four").unwrap();
        let entry = h.engine.backup_file(user.id, &src).await.unwrap();
        assert_eq!(entry.version, 4);
    }

    #[tokio::test]
    async fn test_upload_failure_queues_pending_and_records_event() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "vital.txt", b"data");

        h.primary.set_fail_puts(true);
        let err = h.engine.backup_file(user.id, &src).await.unwrap_err();
        assert!(matches!(err, VaultError::Upload(_)));

        // No metadata row, but a durable recovery obligation and a DR event.
        assert!(repository::get_file_entries(h.engine.pool(), user.id, Some("vital.txt"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            repository::pending_upload_count(h.engine.pool(), Some(user.id))
                .await
                .unwrap(),
            1
        );
        let events = repository::recent_dr_events(h.engine.pool(), Some(user.id), 10)
            .await
            .unwrap();
        assert_eq!(events[0].event_type, DrEventType::UploadFailed);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let err = h
            .engine
            .backup_file(user.id, Path::new("/nonexistent/ghost.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_backup_tree_collects_partial_failures() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        write_source_file(&h, "tree/a.txt", b"a");
        write_source_file(&h, "tree/sub/b.txt", b"b");
        let dir = h.dir.path().join("source/tree");

        let report = h.engine.backup_tree(user.id, &dir, None).await.unwrap();
        assert_eq!(report.backed_up.len(), 2);
        assert!(report.failed.is_empty());

        let entries = repository::get_snapshot_entries(h.engine.pool(), report.snapshot_id)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);

        // With the primary down, the batch still completes and reports.
        h.primary.set_fail_puts(true);
        let report = h.engine.backup_tree(user.id, &dir, None).await.unwrap();
        assert!(report.backed_up.is_empty());
        assert_eq!(report.failed.len(), 2);
    }

    #[tokio::test]
    async fn test_backup_tree_reuses_batch_snapshot() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        write_source_file(&h, "tree/a.txt", b"a");
        write_source_file(&h, "tree/b.txt", b"b");
        let dir = h.dir.path().join("source/tree");

        let report = h.engine.backup_tree(user.id, &dir, None).await.unwrap();

        // One snapshot for the whole batch, no per-file ones; the newest
        // snapshot is the full point-in-time set.
        let snaps = repository::get_snapshots(h.engine.pool(), user.id, 10)
            .await
            .unwrap();
        assert_eq!(snaps.len(), 1);
        let latest = repository::latest_snapshot(h.engine.pool(), user.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, report.snapshot_id);
        let entries = repository::get_snapshot_entries(h.engine.pool(), latest.id)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_event_flags_restore_candidate() {
        let h = testutil::test_harness().await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "gone.txt", b"data");
        h.engine.backup_file(user.id, &src).await.unwrap();

        h.engine
            .handle_file_event(user.id, &src, FileEventKind::Deleted)
            .await
            .unwrap();

        let events = repository::recent_dr_events(h.engine.pool(), Some(user.id), 10)
            .await
            .unwrap();
        assert_eq!(events[0].event_type, DrEventType::AutoRestoreAttempt);
    }
}
