/// Restore pipeline: one-time restore codes plus file and snapshot
/// restore paths.
///
/// Every user-facing restore is gated by a single-use numeric code
/// delivered out of band. Codes are persisted before delivery is
/// attempted, so a delivery hiccup never loses a valid code. Consumption
/// is atomic in the entity store and happens before any download work,
/// so a code is burned by the attempt, not by its outcome.
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;

use crate::engine::Engine;
use crate::error::{Result, VaultError};
use crate::state::models::{DrEventType, FileEntry};
use crate::state::repository;

/// Outcome of a code request. `code` is only populated when
/// `debug_expose_code` is set (local testing without a delivery channel).
#[derive(Debug, Clone, Serialize)]
pub struct CodeRequest {
    pub delivered: bool,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoredFile {
    pub filename: String,
    pub version: i64,
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreFailure {
    pub filename: String,
    pub version: i64,
    pub reason: String,
}

/// Per-entry outcome of a snapshot restore. A partially damaged snapshot
/// restores what it can and reports the rest.
#[derive(Debug, Serialize)]
pub struct SnapshotRestoreReport {
    pub snapshot_id: i64,
    pub restored: Vec<RestoredFile>,
    pub failed: Vec<RestoreFailure>,
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

impl Engine {
    /// Issue a one-time restore code: persist first, then deliver.
    pub async fn request_code(&self, user_id: i64, purpose: &str) -> Result<CodeRequest> {
        repository::require_user(self.pool(), user_id).await?;

        let code = generate_code(self.config().code_length);
        let expires_at = Utc::now() + Duration::seconds(self.config().code_ttl_secs);
        let record = repository::create_code(self.pool(), user_id, &code, expires_at).await?;

        let ttl_mins = self.config().code_ttl_secs / 60;
        let delivered = self
            .notify_user(
                user_id,
                &format!("Restore code for {purpose}: {code}\nValid for {ttl_mins} minutes."),
            )
            .await;

        repository::add_audit(
            self.pool(),
            Some(user_id),
            "code_requested",
            Some(&format!("code {} for {purpose}, delivered={delivered}", record.id)),
        )
        .await?;
        self.record_event(
            Some(user_id),
            DrEventType::CodeIssued,
            &format!("code {} issued for {purpose}, expires {expires_at}", record.id),
        )
        .await?;

        Ok(CodeRequest {
            delivered,
            expires_at,
            code: self.config().debug_expose_code.then_some(code),
        })
    }

    /// Verify and consume a code. Acceptance burns it; rejection burns
    /// nothing.
    pub async fn verify_code(&self, user_id: i64, code: &str) -> Result<()> {
        match repository::consume_code(self.pool(), user_id, code).await? {
            Some(code_id) => {
                repository::add_audit(
                    self.pool(),
                    Some(user_id),
                    "code_verified",
                    Some(&format!("code {code_id} consumed")),
                )
                .await?;
                self.record_event(
                    Some(user_id),
                    DrEventType::CodeUsed,
                    &format!("code {code_id} used"),
                )
                .await?;
                Ok(())
            }
            None => {
                repository::add_audit(self.pool(), Some(user_id), "code_invalid", None).await?;
                Err(VaultError::CodeInvalidOrExpired)
            }
        }
    }

    /// Code-gated single-file restore. `version: None` restores the newest
    /// non-deleted version. The code is consumed up front; a download or
    /// decryption failure afterwards does not refund it.
    pub async fn restore_file(
        &self,
        user_id: i64,
        filename: &str,
        version: Option<i64>,
        target: &Path,
        code: &str,
    ) -> Result<FileEntry> {
        repository::require_user(self.pool(), user_id).await?;
        self.verify_code(user_id, code).await?;

        let entry = match version {
            Some(v) => repository::get_file_entry(self.pool(), user_id, filename, v)
                .await?
                .ok_or_else(|| VaultError::NotFound(format!("{filename} v{v}")))?,
            None => repository::latest_file_entry(self.pool(), user_id, filename)
                .await?
                .ok_or_else(|| VaultError::NotFound(format!("backups of {filename}")))?,
        };

        repository::add_audit(
            self.pool(),
            Some(user_id),
            "restore_start",
            Some(&format!("{filename} v{} -> {}", entry.version, target.display())),
        )
        .await?;

        if let Err(e) = self.restore_entry_to(&entry, target).await {
            let detail = format!("{filename} v{}: {e}", entry.version);
            repository::add_audit(self.pool(), Some(user_id), "restore_failed", Some(&detail))
                .await?;
            self.record_event(Some(user_id), DrEventType::RestoreFailed, &detail)
                .await?;
            return Err(e);
        }

        let detail = format!("{filename} v{} restored to {}", entry.version, target.display());
        repository::add_audit(self.pool(), Some(user_id), "restore_success", Some(&detail))
            .await?;
        self.record_event(Some(user_id), DrEventType::RestorePerformed, &detail)
            .await?;
        self.notify_user(
            user_id,
            &format!("Restore completed: {filename} (v{})", entry.version),
        )
        .await;

        Ok(entry)
    }

    /// Code-gated snapshot restore into `target_dir`. The code (when
    /// policy requires one) is checked once up front, not per entry.
    pub async fn restore_snapshot(
        &self,
        user_id: i64,
        snapshot_id: i64,
        target_dir: &Path,
        code: Option<&str>,
    ) -> Result<SnapshotRestoreReport> {
        repository::require_user(self.pool(), user_id).await?;

        if self.config().require_code_for_snapshot_restore {
            let code = code.ok_or(VaultError::CodeInvalidOrExpired)?;
            self.verify_code(user_id, code).await?;
        }

        let report = self
            .restore_snapshot_unchecked(user_id, snapshot_id, target_dir)
            .await?;

        self.notify_user(
            user_id,
            &format!(
                "Snapshot restore completed: {} files restored, {} failures",
                report.restored.len(),
                report.failed.len()
            ),
        )
        .await;

        Ok(report)
    }

    /// Snapshot restore without code gating. Reserved for trusted internal
    /// callers (DR handlers, drills, device recovery).
    pub(crate) async fn restore_snapshot_unchecked(
        &self,
        user_id: i64,
        snapshot_id: i64,
        target_dir: &Path,
    ) -> Result<SnapshotRestoreReport> {
        let snapshot = repository::get_snapshot(self.pool(), snapshot_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("snapshot {snapshot_id}")))?;
        if snapshot.user_id != user_id {
            return Err(VaultError::NotFound(format!("snapshot {snapshot_id}")));
        }

        let entries = repository::get_snapshot_entries(self.pool(), snapshot_id).await?;

        let mut restored = Vec::new();
        let mut failed = Vec::new();

        for link in entries {
            let entry = match repository::get_file_entry_by_id(self.pool(), link.file_entry_id)
                .await?
            {
                Some(entry) => entry,
                None => {
                    failed.push(RestoreFailure {
                        filename: format!("entry {}", link.file_entry_id),
                        version: 0,
                        reason: "file entry missing".into(),
                    });
                    continue;
                }
            };

            let target = target_dir.join(&entry.filename);
            match self.restore_entry_to(&entry, &target).await {
                Ok(()) => {
                    repository::add_audit(
                        self.pool(),
                        Some(user_id),
                        "snapshot_restore_file",
                        Some(&format!(
                            "{} v{} -> {}",
                            entry.filename,
                            entry.version,
                            target.display()
                        )),
                    )
                    .await?;
                    restored.push(RestoredFile {
                        filename: entry.filename,
                        version: entry.version,
                        target: target.display().to_string(),
                    });
                }
                Err(e) => {
                    repository::add_audit(
                        self.pool(),
                        Some(user_id),
                        "snapshot_restore_failed",
                        Some(&format!("{} v{}: {e}", entry.filename, entry.version)),
                    )
                    .await?;
                    failed.push(RestoreFailure {
                        filename: entry.filename,
                        version: entry.version,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.record_event(
            Some(user_id),
            DrEventType::SnapshotRestore,
            &format!(
                "snapshot {snapshot_id} restored: success={} fail={}",
                restored.len(),
                failed.len()
            ),
        )
        .await?;

        Ok(SnapshotRestoreReport {
            snapshot_id,
            restored,
            failed,
        })
    }

    /// Fetch, integrity-check and decrypt one stored version to `target`.
    ///
    /// The primary store is tried first; on failure (or a checksum
    /// mismatch, which means a diverged or corrupted replica) each
    /// secondary is tried in order.
    pub(crate) async fn restore_entry_to(&self, entry: &FileEntry, target: &Path) -> Result<()> {
        let mut last_err: VaultError =
            VaultError::Download(format!("no replica holds {}", entry.locator));

        let mut stores = vec![self.primary()];
        stores.extend(self.secondaries().iter().map(|s| s.as_ref()));

        let mut ciphertext = None;
        for store in stores {
            match store.get(&entry.locator).await {
                Ok(data) => {
                    if crate::crypto::hash::verify_checksum(&data, &entry.checksum) {
                        ciphertext = Some(data);
                        break;
                    }
                    tracing::warn!(
                        locator = entry.locator,
                        store = store.name(),
                        "Checksum mismatch on stored blob"
                    );
                    last_err = VaultError::Download(format!(
                        "checksum mismatch for {} in {}",
                        entry.locator,
                        store.name()
                    ));
                }
                Err(e) => {
                    tracing::warn!(
                        locator = entry.locator,
                        store = store.name(),
                        error = %e,
                        "Blob fetch failed"
                    );
                    last_err = e;
                }
            }
        }
        let ciphertext = ciphertext.ok_or(last_err)?;

        let plaintext = self.cipher().decrypt(&ciphertext)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &plaintext).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::BlobStore;
    use crate::testutil::{self, write_source_file};

    fn debug_config() -> EngineConfig {
        EngineConfig {
            debug_expose_code: true,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_request_restore_then_reuse_fails() {
        let h = testutil::test_harness_with(debug_config()).await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"original contents");
        h.engine.backup_file(user.id, &src).await.unwrap();

        let req = h.engine.request_code(user.id, "restore").await.unwrap();
        assert!(req.delivered);
        let code = req.code.unwrap();

        let target = h.dir.path().join("restored/doc.txt");
        h.engine
            .restore_file(user.id, "doc.txt", None, &target, &code)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"original contents");

        // Same code again: rejected.
        let err = h
            .engine
            .restore_file(user.id, "doc.txt", None, &target, &code)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::CodeInvalidOrExpired));
    }

    #[tokio::test]
    async fn test_restore_specific_and_latest_version() {
        let h = testutil::test_harness_with(debug_config()).await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"v1");
        h.engine.backup_file(user.id, &src).await.unwrap();
        std::fs::write(&src, b"v2").unwrap();
        h.engine.backup_file(user.id, &src).await.unwrap();

        let code = h.engine.request_code(user.id, "restore").await.unwrap().code.unwrap();
        let target = h.dir.path().join("out/doc.txt");
        let entry = h
            .engine
            .restore_file(user.id, "doc.txt", Some(1), &target, &code)
            .await
            .unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(std::fs::read(&target).unwrap(), b"v1");

        let code = h.engine.request_code(user.id, "restore").await.unwrap().code.unwrap();
        let entry = h
            .engine
            .restore_file(user.id, "doc.txt", None, &target, &code)
            .await
            .unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(std::fs::read(&target).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_wrong_code_rejected_and_nothing_burned() {
        let h = testutil::test_harness_with(debug_config()).await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"data");
        h.engine.backup_file(user.id, &src).await.unwrap();

        let code = h.engine.request_code(user.id, "restore").await.unwrap().code.unwrap();
        let target = h.dir.path().join("out/doc.txt");

        let err = h
            .engine
            .restore_file(user.id, "doc.txt", None, &target, "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::CodeInvalidOrExpired));

        // The issued code is still valid.
        h.engine
            .restore_file(user.id, "doc.txt", None, &target, &code)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_download_still_consumes_code() {
        let h = testutil::test_harness_with(debug_config()).await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"data");
        let entry = h.engine.backup_file(user.id, &src).await.unwrap();

        // No replica has the blob anymore.
        h.primary.delete(&entry.locator).await.unwrap();

        let code = h.engine.request_code(user.id, "restore").await.unwrap().code.unwrap();
        let target = h.dir.path().join("out/doc.txt");
        let err = h
            .engine
            .restore_file(user.id, "doc.txt", None, &target, &code)
            .await
            .unwrap_err();
        assert!(!matches!(err, VaultError::CodeInvalidOrExpired));

        // Consumed by the attempt.
        let err = h.engine.verify_code(user.id, &code).await.unwrap_err();
        assert!(matches!(err, VaultError::CodeInvalidOrExpired));
    }

    #[tokio::test]
    async fn test_restore_falls_back_to_secondary_replica() {
        let h = testutil::test_harness_with(debug_config()).await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"precious");
        let entry = h.engine.backup_file(user.id, &src).await.unwrap();

        // Simulate replication, then lose the primary copy.
        let blob = h.primary.get(&entry.locator).await.unwrap();
        h.secondary.put(&entry.locator, &blob).await.unwrap();
        h.primary.delete(&entry.locator).await.unwrap();

        let code = h.engine.request_code(user.id, "restore").await.unwrap().code.unwrap();
        let target = h.dir.path().join("out/doc.txt");
        h.engine
            .restore_file(user.id, "doc.txt", None, &target, &code)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn test_snapshot_restore_reports_partial_failure() {
        let h = testutil::test_harness_with(debug_config()).await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        write_source_file(&h, "set/a.txt", b"a");
        write_source_file(&h, "set/b.txt", b"b");
        write_source_file(&h, "set/c.txt", b"c");
        let dir = h.dir.path().join("source/set");
        let report = h.engine.backup_tree(user.id, &dir, None).await.unwrap();

        // Lose one blob.
        let lost = &report.backed_up[1];
        h.primary.delete(&lost.locator).await.unwrap();

        let code = h.engine.request_code(user.id, "restore").await.unwrap().code.unwrap();
        let out = h.dir.path().join("restored");
        let result = h
            .engine
            .restore_snapshot(user.id, report.snapshot_id, &out, Some(&code))
            .await
            .unwrap();

        assert_eq!(result.restored.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].filename, lost.filename);
        assert!(out.join("a.txt").exists());
        assert!(out.join("c.txt").exists());
    }

    #[tokio::test]
    async fn test_snapshot_restore_requires_code_when_configured() {
        let h = testutil::test_harness_with(debug_config()).await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let src = write_source_file(&h, "doc.txt", b"data");
        h.engine.backup_file(user.id, &src).await.unwrap();
        let snap = repository::latest_snapshot(h.engine.pool(), user.id)
            .await
            .unwrap()
            .unwrap();

        let out = h.dir.path().join("restored");
        let err = h
            .engine
            .restore_snapshot(user.id, snap.id, &out, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::CodeInvalidOrExpired));
    }

    #[tokio::test]
    async fn test_expired_code_rejected() {
        let h = testutil::test_harness_with(EngineConfig {
            debug_expose_code: true,
            code_ttl_secs: -1,
            ..EngineConfig::default()
        })
        .await;
        let user = testutil::make_user(h.engine.pool(), "a@example.com").await;
        let code = h.engine.request_code(user.id, "restore").await.unwrap().code.unwrap();
        let err = h.engine.verify_code(user.id, &code).await.unwrap_err();
        assert!(matches!(err, VaultError::CodeInvalidOrExpired));
    }

    #[test]
    fn test_generated_codes_are_numeric_fixed_length() {
        for _ in 0..20 {
            let code = generate_code(6);
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
