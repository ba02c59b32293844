/// Disaster-recovery orchestration: ransomware response, corruption
/// response, primary-store failover, drills, device recovery and
/// reporting.
///
/// Handlers are conservative: they preserve state and surface evidence
/// rather than rolling anything back automatically. Sub-step failures
/// are audited and the handler continues; a DR response never makes the
/// situation worse by aborting halfway.
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::engine::Engine;
use crate::error::{Result, VaultError};
use crate::restore::SnapshotRestoreReport;
use crate::state::models::{DrEvent, DrEventType, DrSummary};
use crate::state::repository;

/// What the external detector saw. Heuristics live outside the engine;
/// this is only their verdict.
#[derive(Debug, Clone, Serialize)]
pub struct RansomwareEvidence {
    /// Affected file paths as observed on the device.
    pub files: Vec<String>,
    /// Detector's reason, e.g. "extension_change" or "mass_modification".
    pub reason: String,
}

/// Machine-readable DR status report.
#[derive(Debug, Serialize)]
pub struct DrReport {
    pub generated_at: DateTime<Utc>,
    pub user_id: Option<i64>,
    pub summary: DrSummary,
    pub recent_events: Vec<DrEvent>,
}

impl DrReport {
    /// Human-readable rendering for the CLI and notifications.
    pub fn render_text(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("DR Report - generated: {}", self.generated_at));
        match self.user_id {
            Some(id) => lines.push(format!("User: {id}")),
            None => lines.push("User: all".into()),
        }
        lines.push("Summary:".into());
        lines.push(format!("  - backups_last_24h: {}", self.summary.backups_last_24h));
        lines.push(format!("  - snapshots_total: {}", self.summary.snapshots_total));
        lines.push(format!("  - drevents_last_24h: {}", self.summary.drevents_last_24h));
        lines.push(format!("  - unsynced_files: {}", self.summary.unsynced_files));
        lines.push(format!(
            "  - replication_pending: {}",
            self.summary.replication_pending
        ));
        lines.push("Recent events:".into());
        for event in self.recent_events.iter().take(20) {
            lines.push(format!(
                "  - [{}] {}: {}",
                event.created_at,
                event.event_type,
                event.details.as_deref().unwrap_or("-")
            ));
        }
        lines.join("\n")
    }
}

impl Engine {
    /// Respond to suspected ransomware: record the evidence, take a
    /// defensive snapshot of the latest stored version of each affected
    /// file, flag those versions, and tell the user. Never rolls back.
    pub async fn respond_ransomware(
        &self,
        user_id: i64,
        evidence: &RansomwareEvidence,
    ) -> Result<i64> {
        let details = serde_json::to_string(evidence).unwrap_or_else(|_| evidence.reason.clone());
        let event_id = self
            .record_event(Some(user_id), DrEventType::RansomwareDetected, &details)
            .await?;

        let snapshot = repository::create_snapshot(
            self.pool(),
            user_id,
            Some("defensive-ransom-snap"),
            Some(&format!("Defensive snapshot at {}", Utc::now())),
        )
        .await?;

        for path in &evidence.files {
            let filename = match Path::new(path).file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            match repository::latest_file_entry(self.pool(), user_id, filename).await {
                Ok(Some(latest)) => {
                    repository::add_snapshot_entry(self.pool(), snapshot.id, latest.id).await?;
                    repository::mark_suspected_ransomware(self.pool(), latest.id).await?;
                }
                Ok(None) => {}
                Err(e) => {
                    repository::add_audit(
                        self.pool(),
                        Some(user_id),
                        "defensive_snapshot_failed",
                        Some(&format!("{filename}: {e}")),
                    )
                    .await?;
                }
            }
        }
        repository::add_audit(
            self.pool(),
            Some(user_id),
            "defensive_snapshot_created",
            Some(&format!("snapshot {} ({})", snapshot.id, evidence.reason)),
        )
        .await?;

        self.notify_user(
            user_id,
            "Ransomware-suspected activity detected.\n\
             A defensive snapshot was created and the suspected versions were flagged.\n\
             Review before restoring anything.",
        )
        .await;

        Ok(event_id)
    }

    /// Respond to detected corruption of a local file. With a known-good
    /// version on record, an automatic un-gated restore to the original
    /// path is attempted; without one, the user is told there is nothing
    /// to roll back to.
    pub async fn respond_corruption(
        &self,
        user_id: i64,
        corrupted_path: &Path,
        known_good_version: Option<i64>,
    ) -> Result<()> {
        let filename = corrupted_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                VaultError::NotFound(format!("file name in {}", corrupted_path.display()))
            })?;

        let details = json!({
            "filename": filename,
            "last_good_version": known_good_version,
        })
        .to_string();
        self.record_event(Some(user_id), DrEventType::CorruptionDetected, &details)
            .await?;

        // Flag the current latest stored version as corrupt.
        if let Some(latest) = repository::latest_file_entry(self.pool(), user_id, filename).await? {
            if Some(latest.version) != known_good_version {
                repository::mark_corrupted(self.pool(), latest.id).await?;
            }
        }

        let Some(version) = known_good_version else {
            self.notify_user(
                user_id,
                &format!("Corruption detected for {filename}, no previous good version found."),
            )
            .await;
            return Ok(());
        };

        self.record_event(
            Some(user_id),
            DrEventType::AutoRestoreAttempt,
            &format!("{filename} v{version} -> {}", corrupted_path.display()),
        )
        .await?;

        // A missing known-good entry (pruned, or a stale detector) is a
        // restore failure like any other, not an abort.
        let outcome = match repository::get_file_entry(self.pool(), user_id, filename, version)
            .await?
        {
            Some(entry) => self.restore_entry_to(&entry, corrupted_path).await,
            None => Err(VaultError::NotFound(format!("{filename} v{version}"))),
        };

        match outcome {
            Ok(()) => {
                self.record_event(
                    Some(user_id),
                    DrEventType::AutoRestoreSuccess,
                    &format!("{filename} restored to v{version}"),
                )
                .await?;
                self.notify_user(
                    user_id,
                    &format!("Auto-restore completed for {filename} (v{version}). Check file integrity."),
                )
                .await;
            }
            Err(e) => {
                self.record_event(
                    Some(user_id),
                    DrEventType::AutoRestoreFailed,
                    &format!("{filename} v{version}: {e}"),
                )
                .await?;
                self.notify_user(
                    user_id,
                    &format!("Auto-restore failed for {filename}. Manual intervention required."),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Record and announce that the primary store is unreachable.
    /// Restores keep working from the secondaries; this only makes the
    /// outage visible.
    pub async fn respond_primary_down(&self, user_id: Option<i64>, reason: &str) -> Result<i64> {
        let event_id = self
            .record_event(user_id, DrEventType::PrimaryStorageDown, reason)
            .await?;
        repository::add_audit(self.pool(), user_id, "failover_initiated", Some(reason)).await?;
        if let Some(user_id) = user_id {
            self.notify_user(
                user_id,
                &format!("Primary storage down. Failover procedure initiated. Reason: {reason}"),
            )
            .await;
        }
        Ok(event_id)
    }

    /// DR drill: restore the newest snapshot into a scratch directory,
    /// proving the recovery path end to end without touching live data.
    pub async fn run_drill(&self, user_id: i64, scratch_dir: &Path) -> Result<SnapshotRestoreReport> {
        let snapshot = repository::latest_snapshot(self.pool(), user_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("snapshots for user {user_id}")))?;

        repository::add_audit(
            self.pool(),
            Some(user_id),
            "dr_drill_start",
            Some(&format!("snapshot {}", snapshot.id)),
        )
        .await?;

        let report = self
            .restore_snapshot_unchecked(user_id, snapshot.id, scratch_dir)
            .await?;

        self.record_event(
            Some(user_id),
            DrEventType::DrDrillCompleted,
            &format!(
                "snapshot {}: restored={} failed={}",
                snapshot.id,
                report.restored.len(),
                report.failed.len()
            ),
        )
        .await?;
        Ok(report)
    }

    /// Recover a lost device: restore the newest snapshot into
    /// `restore_dir`. The drill path made real.
    pub async fn recover_device(
        &self,
        user_id: i64,
        restore_dir: &Path,
    ) -> Result<SnapshotRestoreReport> {
        let snapshot = match repository::latest_snapshot(self.pool(), user_id).await? {
            Some(snapshot) => snapshot,
            None => {
                self.record_event(
                    Some(user_id),
                    DrEventType::DeviceRecoveryFailed,
                    "no snapshots available to restore",
                )
                .await?;
                return Err(VaultError::NotFound(format!("snapshots for user {user_id}")));
            }
        };

        repository::add_audit(
            self.pool(),
            Some(user_id),
            "recover_start",
            Some(&format!("snapshot {} -> {}", snapshot.id, restore_dir.display())),
        )
        .await?;

        match self
            .restore_snapshot_unchecked(user_id, snapshot.id, restore_dir)
            .await
        {
            Ok(report) => {
                self.record_event(
                    Some(user_id),
                    DrEventType::DeviceRecovered,
                    &format!(
                        "snapshot {} restored to {} ({} files, {} failures)",
                        snapshot.id,
                        restore_dir.display(),
                        report.restored.len(),
                        report.failed.len()
                    ),
                )
                .await?;
                self.notify_user(
                    user_id,
                    &format!(
                        "Device recovery completed. Snapshot {} restored to {}",
                        snapshot.id,
                        restore_dir.display()
                    ),
                )
                .await;
                Ok(report)
            }
            Err(e) => {
                self.record_event(
                    Some(user_id),
                    DrEventType::DeviceRecoveryFailed,
                    &format!("snapshot {}: {e}", snapshot.id),
                )
                .await?;
                self.notify_user(user_id, &format!("Device recovery failed: {e}")).await;
                Err(e)
            }
        }
    }

    /// Build the DR status report: aggregate counters plus the most
    /// recent events.
    pub async fn report(&self, user_id: Option<i64>) -> Result<DrReport> {
        let summary = repository::dr_summary(self.pool(), user_id).await?;
        let recent_events = repository::recent_dr_events(self.pool(), user_id, 100).await?;
        Ok(DrReport {
            generated_at: Utc::now(),
            user_id,
            summary,
            recent_events,
        })
    }
}
