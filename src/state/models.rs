/// Entity-store row types.
///
/// These structs map directly to SQLite tables and are used for both
/// reading and writing via sqlx. The entity store is the single source of
/// truth for existence and status; the blob store holds only opaque bytes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered user. Owns all other entities transitively.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Contact address for the notification channel (e.g. a Telegram chat id).
    pub notify_addr: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One backed-up, encrypted version of one logical file for one user.
///
/// `(user_id, filename, version)` is unique and versions are never reused,
/// even after pruning: pruning soft-deletes rows, and the next version is
/// always derived from the maximum over all rows.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: i64,
    pub user_id: i64,
    /// Logical base filename, not a full path.
    pub filename: String,
    pub version: i64,
    /// Opaque handle into the blob store.
    pub locator: String,
    /// BLAKE3 hex digest of the *encrypted* payload.
    pub checksum: String,
    /// Soft-delete flag set by pruning; the row is retained.
    pub deleted: bool,
    pub suspected_ransomware: bool,
    pub corrupted: bool,
    pub created_at: DateTime<Utc>,
}

/// A named, timestamped grouping of file versions: one point-in-time set.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub user_id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Link from a snapshot to one file entry. Entries are shared by
/// reference: deleting a snapshot never cascades into file entries.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: i64,
    pub snapshot_id: i64,
    pub file_entry_id: i64,
}

/// One outstanding obligation to copy a stored blob to the secondary
/// store. Kept (flagged `replicated`) after success for audit.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub id: i64,
    pub file_entry_id: i64,
    pub locator: String,
    pub attempted: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub replicated: bool,
    pub created_at: DateTime<Utc>,
}

/// A local change not yet confirmed durable in primary storage.
/// This is an at-least-once queue: rows are popped for processing and
/// re-created on failure, never silently dropped.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PendingUpload {
    pub id: i64,
    pub user_id: i64,
    pub local_path: String,
    pub filename: String,
    pub queued_at: DateTime<Utc>,
    pub attempts: i64,
}

/// Short-lived single-use authorization artifact gating restores.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OneTimeCode {
    pub id: i64,
    pub user_id: i64,
    pub code: String,
    pub expiry: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

/// Disaster-recovery event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DrEventType {
    UploadFailed,
    RansomwareDetected,
    CorruptionDetected,
    AutoRestoreAttempt,
    AutoRestoreSuccess,
    AutoRestoreFailed,
    PrimaryStorageDown,
    CodeIssued,
    CodeUsed,
    RestorePerformed,
    RestoreFailed,
    SnapshotRestore,
    RecoveryUploadFailed,
    PendingUploadAbandoned,
    ReplicationAttemptsExhausted,
    DrDrillCompleted,
    DeviceRecovered,
    DeviceRecoveryFailed,
}

impl DrEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrEventType::UploadFailed => "upload_failed",
            DrEventType::RansomwareDetected => "ransomware_detected",
            DrEventType::CorruptionDetected => "corruption_detected",
            DrEventType::AutoRestoreAttempt => "auto_restore_attempt",
            DrEventType::AutoRestoreSuccess => "auto_restore_success",
            DrEventType::AutoRestoreFailed => "auto_restore_failed",
            DrEventType::PrimaryStorageDown => "primary_storage_down",
            DrEventType::CodeIssued => "code_issued",
            DrEventType::CodeUsed => "code_used",
            DrEventType::RestorePerformed => "restore_performed",
            DrEventType::RestoreFailed => "restore_failed",
            DrEventType::SnapshotRestore => "snapshot_restore",
            DrEventType::RecoveryUploadFailed => "recovery_upload_failed",
            DrEventType::PendingUploadAbandoned => "pending_upload_abandoned",
            DrEventType::ReplicationAttemptsExhausted => "replication_attempts_exhausted",
            DrEventType::DrDrillCompleted => "dr_drill_completed",
            DrEventType::DeviceRecovered => "device_recovered",
            DrEventType::DeviceRecoveryFailed => "device_recovery_failed",
        }
    }
}

impl std::fmt::Display for DrEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit-ledger row. Only the `handled` flag is ever mutated;
/// rows are never deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DrEvent {
    pub id: i64,
    /// Nullable: some events are system-wide.
    pub user_id: Option<i64>,
    pub event_type: DrEventType,
    pub details: Option<String>,
    pub handled: bool,
    pub created_at: DateTime<Utc>,
}

/// One line of the operational audit log.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub details: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// Aggregate counters for the DR report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrSummary {
    pub backups_last_24h: i64,
    pub snapshots_total: i64,
    pub drevents_last_24h: i64,
    pub unsynced_files: i64,
    pub replication_pending: i64,
}
