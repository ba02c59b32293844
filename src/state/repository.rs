/// Repository layer: typed database queries for the entity store.
///
/// All queries use sqlx runtime-checked queries (not compile-time checked)
/// to avoid requiring a live database during development builds. Every
/// multi-step invariant (version allocation, pruning, code consumption)
/// runs inside a single transaction.
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use super::models::*;
use crate::error::{Result, VaultError};

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ── Users ──

pub async fn create_user(
    pool: &SqlitePool,
    email: &str,
    notify_addr: Option<&str>,
) -> Result<User> {
    sqlx::query_as::<_, User>(
        "INSERT INTO users (email, notify_addr, created_at) VALUES (?, ?, ?) RETURNING *",
    )
    .bind(email)
    .bind(notify_addr)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            VaultError::AlreadyExists(format!("user {email}"))
        } else {
            e.into()
        }
    })
}

pub async fn get_user(pool: &SqlitePool, user_id: i64) -> Result<Option<User>> {
    Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?)
}

pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?)
}

/// Fetch a user or fail with `NotFound`.
pub async fn require_user(pool: &SqlitePool, user_id: i64) -> Result<User> {
    get_user(pool, user_id)
        .await?
        .ok_or_else(|| VaultError::NotFound(format!("user {user_id}")))
}

pub async fn set_notify_addr(pool: &SqlitePool, user_id: i64, addr: &str) -> Result<()> {
    sqlx::query("UPDATE users SET notify_addr = ? WHERE id = ?")
        .bind(addr)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Audit log ──

pub async fn add_audit(
    pool: &SqlitePool,
    user_id: Option<i64>,
    action: &str,
    details: Option<&str>,
) -> Result<()> {
    sqlx::query("INSERT INTO audit_log (user_id, action, details, logged_at) VALUES (?, ?, ?, ?)")
        .bind(user_id)
        .bind(action)
        .bind(details)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn recent_audit(
    pool: &SqlitePool,
    user_id: Option<i64>,
    limit: i64,
) -> Result<Vec<AuditEntry>> {
    let rows = match user_id {
        Some(uid) => {
            sqlx::query_as::<_, AuditEntry>(
                "SELECT * FROM audit_log WHERE user_id = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(uid)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, AuditEntry>("SELECT * FROM audit_log ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows)
}

// ── File entries ──

/// Next version for `(user, filename)`: max over ALL rows plus one,
/// soft-deleted included, so versions are never reused after pruning.
pub async fn next_version(pool: &SqlitePool, user_id: i64, filename: &str) -> Result<i64> {
    let (max,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(version), 0) FROM file_entries WHERE user_id = ? AND filename = ?",
    )
    .bind(user_id)
    .bind(filename)
    .fetch_one(pool)
    .await?;
    Ok(max + 1)
}

pub async fn insert_file_entry(
    pool: &SqlitePool,
    user_id: i64,
    filename: &str,
    version: i64,
    locator: &str,
    checksum: &str,
) -> Result<FileEntry> {
    sqlx::query_as::<_, FileEntry>(
        r#"
        INSERT INTO file_entries
        (user_id, filename, version, locator, checksum, deleted, suspected_ransomware, corrupted, created_at)
        VALUES (?, ?, ?, ?, ?, 0, 0, 0, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(filename)
    .bind(version)
    .bind(locator)
    .bind(checksum)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            VaultError::Conflict(format!("{filename} v{version} was registered concurrently"))
        } else {
            e.into()
        }
    })
}

/// Non-deleted entries for a user, newest version first, optionally
/// filtered to one filename.
pub async fn get_file_entries(
    pool: &SqlitePool,
    user_id: i64,
    filename: Option<&str>,
) -> Result<Vec<FileEntry>> {
    let rows = match filename {
        Some(name) => {
            sqlx::query_as::<_, FileEntry>(
                r#"
                SELECT * FROM file_entries
                WHERE user_id = ? AND filename = ? AND deleted = 0
                ORDER BY version DESC
                "#,
            )
            .bind(user_id)
            .bind(name)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, FileEntry>(
                r#"
                SELECT * FROM file_entries
                WHERE user_id = ? AND deleted = 0
                ORDER BY filename, version DESC
                "#,
            )
            .bind(user_id)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

pub async fn get_file_entry(
    pool: &SqlitePool,
    user_id: i64,
    filename: &str,
    version: i64,
) -> Result<Option<FileEntry>> {
    Ok(sqlx::query_as::<_, FileEntry>(
        r#"
        SELECT * FROM file_entries
        WHERE user_id = ? AND filename = ? AND version = ? AND deleted = 0
        "#,
    )
    .bind(user_id)
    .bind(filename)
    .bind(version)
    .fetch_optional(pool)
    .await?)
}

pub async fn get_file_entry_by_id(pool: &SqlitePool, id: i64) -> Result<Option<FileEntry>> {
    Ok(
        sqlx::query_as::<_, FileEntry>("SELECT * FROM file_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?,
    )
}

/// Newest non-deleted entry for `(user, filename)`, if any.
pub async fn latest_file_entry(
    pool: &SqlitePool,
    user_id: i64,
    filename: &str,
) -> Result<Option<FileEntry>> {
    Ok(sqlx::query_as::<_, FileEntry>(
        r#"
        SELECT * FROM file_entries
        WHERE user_id = ? AND filename = ? AND deleted = 0
        ORDER BY version DESC LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(filename)
    .fetch_optional(pool)
    .await?)
}

pub async fn mark_corrupted(pool: &SqlitePool, entry_id: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE file_entries SET corrupted = 1 WHERE id = ?")
        .bind(entry_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn mark_suspected_ransomware(pool: &SqlitePool, entry_id: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE file_entries SET suspected_ransomware = 1 WHERE id = ?")
        .bind(entry_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Soft-delete all but the newest `keep` non-deleted versions of a file.
///
/// Returns `(entry_id, locator)` of each pruned row so the caller can
/// best-effort delete the underlying blobs. Selection and flagging happen
/// in one transaction so racing pruners cannot double-report a victim.
pub async fn prune_old_versions(
    pool: &SqlitePool,
    user_id: i64,
    filename: &str,
    keep: i64,
) -> Result<Vec<(i64, String)>> {
    let mut tx = pool.begin().await?;

    let victims: Vec<FileEntry> = sqlx::query_as(
        r#"
        SELECT * FROM file_entries
        WHERE user_id = ? AND filename = ? AND deleted = 0
        ORDER BY version DESC
        LIMIT -1 OFFSET ?
        "#,
    )
    .bind(user_id)
    .bind(filename)
    .bind(keep)
    .fetch_all(&mut *tx)
    .await?;

    for victim in &victims {
        sqlx::query("UPDATE file_entries SET deleted = 1 WHERE id = ?")
            .bind(victim.id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(victims.into_iter().map(|v| (v.id, v.locator)).collect())
}

// ── Snapshots ──

pub async fn create_snapshot(
    pool: &SqlitePool,
    user_id: i64,
    name: Option<&str>,
    description: Option<&str>,
) -> Result<Snapshot> {
    Ok(sqlx::query_as::<_, Snapshot>(
        "INSERT INTO snapshots (user_id, name, description, created_at) VALUES (?, ?, ?, ?) RETURNING *",
    )
    .bind(user_id)
    .bind(name)
    .bind(description)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?)
}

pub async fn add_snapshot_entry(
    pool: &SqlitePool,
    snapshot_id: i64,
    file_entry_id: i64,
) -> Result<SnapshotEntry> {
    Ok(sqlx::query_as::<_, SnapshotEntry>(
        "INSERT INTO snapshot_entries (snapshot_id, file_entry_id) VALUES (?, ?) RETURNING *",
    )
    .bind(snapshot_id)
    .bind(file_entry_id)
    .fetch_one(pool)
    .await?)
}

pub async fn get_snapshot(pool: &SqlitePool, snapshot_id: i64) -> Result<Option<Snapshot>> {
    Ok(
        sqlx::query_as::<_, Snapshot>("SELECT * FROM snapshots WHERE id = ?")
            .bind(snapshot_id)
            .fetch_optional(pool)
            .await?,
    )
}

pub async fn get_snapshots(pool: &SqlitePool, user_id: i64, limit: i64) -> Result<Vec<Snapshot>> {
    Ok(sqlx::query_as::<_, Snapshot>(
        "SELECT * FROM snapshots WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?)
}

pub async fn latest_snapshot(pool: &SqlitePool, user_id: i64) -> Result<Option<Snapshot>> {
    Ok(sqlx::query_as::<_, Snapshot>(
        "SELECT * FROM snapshots WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?)
}

pub async fn get_snapshot_entries(
    pool: &SqlitePool,
    snapshot_id: i64,
) -> Result<Vec<SnapshotEntry>> {
    Ok(sqlx::query_as::<_, SnapshotEntry>(
        "SELECT * FROM snapshot_entries WHERE snapshot_id = ? ORDER BY id",
    )
    .bind(snapshot_id)
    .fetch_all(pool)
    .await?)
}

// ── Replication queue ──

pub async fn enqueue_replication(
    pool: &SqlitePool,
    file_entry_id: i64,
    locator: &str,
) -> Result<ReplicationTask> {
    Ok(sqlx::query_as::<_, ReplicationTask>(
        r#"
        INSERT INTO replication_tasks (file_entry_id, locator, attempted, replicated, created_at)
        VALUES (?, ?, 0, 0, ?)
        RETURNING *
        "#,
    )
    .bind(file_entry_id)
    .bind(locator)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?)
}

/// Unreplicated tasks that still have attempt budget, oldest first.
pub async fn pending_replication_tasks(
    pool: &SqlitePool,
    limit: i64,
    max_attempts: i64,
) -> Result<Vec<ReplicationTask>> {
    Ok(sqlx::query_as::<_, ReplicationTask>(
        r#"
        SELECT * FROM replication_tasks
        WHERE replicated = 0 AND attempted < ?
        ORDER BY created_at ASC, id ASC
        LIMIT ?
        "#,
    )
    .bind(max_attempts)
    .bind(limit)
    .fetch_all(pool)
    .await?)
}

/// Stamp an attempt before the copy is tried, so a crash mid-copy still
/// shows the attempt was made.
pub async fn record_replication_attempt(pool: &SqlitePool, task_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE replication_tasks SET attempted = attempted + 1, last_attempt_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_replicated(pool: &SqlitePool, task_id: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE replication_tasks SET replicated = 1, last_attempt_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn replication_pending_count(pool: &SqlitePool, user_id: Option<i64>) -> Result<i64> {
    let (count,): (i64,) = match user_id {
        Some(uid) => {
            sqlx::query_as(
                r#"
                SELECT COUNT(*) FROM replication_tasks r
                JOIN file_entries f ON f.id = r.file_entry_id
                WHERE r.replicated = 0 AND f.user_id = ?
                "#,
            )
            .bind(uid)
            .fetch_one(pool)
            .await?
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM replication_tasks WHERE replicated = 0")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

// ── Pending uploads (crash recovery) ──

pub async fn add_pending_upload(
    pool: &SqlitePool,
    user_id: i64,
    local_path: &str,
    filename: &str,
    attempts: i64,
) -> Result<PendingUpload> {
    Ok(sqlx::query_as::<_, PendingUpload>(
        r#"
        INSERT INTO pending_uploads (user_id, local_path, filename, queued_at, attempts)
        VALUES (?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(local_path)
    .bind(filename)
    .bind(Utc::now())
    .bind(attempts)
    .fetch_one(pool)
    .await?)
}

/// Pop up to `limit` pending uploads, oldest first. Rows are removed here;
/// the caller must re-insert on failure so the obligation is never lost.
pub async fn pop_pending_uploads(pool: &SqlitePool, limit: i64) -> Result<Vec<PendingUpload>> {
    Ok(sqlx::query_as::<_, PendingUpload>(
        r#"
        DELETE FROM pending_uploads
        WHERE id IN (SELECT id FROM pending_uploads ORDER BY queued_at ASC, id ASC LIMIT ?)
        RETURNING *
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?)
}

pub async fn pending_upload_count(pool: &SqlitePool, user_id: Option<i64>) -> Result<i64> {
    let (count,): (i64,) = match user_id {
        Some(uid) => {
            sqlx::query_as("SELECT COUNT(*) FROM pending_uploads WHERE user_id = ?")
                .bind(uid)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM pending_uploads")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

// ── One-time codes ──

pub async fn create_code(
    pool: &SqlitePool,
    user_id: i64,
    code: &str,
    expiry: DateTime<Utc>,
) -> Result<OneTimeCode> {
    Ok(sqlx::query_as::<_, OneTimeCode>(
        r#"
        INSERT INTO one_time_codes (user_id, code, expiry, used, created_at)
        VALUES (?, ?, ?, 0, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(code)
    .bind(expiry)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?)
}

/// Atomically consume a code: valid iff unused and unexpired, and marking
/// it used happens in the same statement, so a code can never authorize
/// twice. Returns the consumed code's id, or `None` if rejected (a
/// rejection does not burn anything).
pub async fn consume_code(pool: &SqlitePool, user_id: i64, code: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE one_time_codes SET used = 1
        WHERE id = (
            SELECT id FROM one_time_codes
            WHERE user_id = ? AND code = ? AND used = 0 AND expiry > ?
            LIMIT 1
        )
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(code)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id,)| id))
}

// ── DR events ──

pub async fn record_dr_event(
    pool: &SqlitePool,
    user_id: Option<i64>,
    event_type: DrEventType,
    details: Option<&str>,
) -> Result<DrEvent> {
    Ok(sqlx::query_as::<_, DrEvent>(
        r#"
        INSERT INTO dr_events (user_id, event_type, details, handled, created_at)
        VALUES (?, ?, ?, 0, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(event_type)
    .bind(details)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?)
}

pub async fn mark_dr_event_handled(pool: &SqlitePool, event_id: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE dr_events SET handled = 1 WHERE id = ?")
        .bind(event_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn recent_dr_events(
    pool: &SqlitePool,
    user_id: Option<i64>,
    limit: i64,
) -> Result<Vec<DrEvent>> {
    let rows = match user_id {
        Some(uid) => {
            sqlx::query_as::<_, DrEvent>(
                "SELECT * FROM dr_events WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(uid)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, DrEvent>(
                "SELECT * FROM dr_events ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

/// Aggregate counters for DR reporting.
pub async fn dr_summary(pool: &SqlitePool, user_id: Option<i64>) -> Result<DrSummary> {
    let since = Utc::now() - Duration::days(1);

    let (backups_last_24h,): (i64,) = match user_id {
        Some(uid) => {
            sqlx::query_as(
                "SELECT COUNT(*) FROM file_entries WHERE user_id = ? AND created_at >= ?",
            )
            .bind(uid)
            .bind(since)
            .fetch_one(pool)
            .await?
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM file_entries WHERE created_at >= ?")
                .bind(since)
                .fetch_one(pool)
                .await?
        }
    };

    let (snapshots_total,): (i64,) = match user_id {
        Some(uid) => {
            sqlx::query_as("SELECT COUNT(*) FROM snapshots WHERE user_id = ?")
                .bind(uid)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM snapshots")
                .fetch_one(pool)
                .await?
        }
    };

    let (drevents_last_24h,): (i64,) = match user_id {
        Some(uid) => {
            sqlx::query_as("SELECT COUNT(*) FROM dr_events WHERE user_id = ? AND created_at >= ?")
                .bind(uid)
                .bind(since)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM dr_events WHERE created_at >= ?")
                .bind(since)
                .fetch_one(pool)
                .await?
        }
    };

    Ok(DrSummary {
        backups_last_24h,
        snapshots_total,
        drevents_last_24h,
        unsynced_files: pending_upload_count(pool, user_id).await?,
        replication_pending: replication_pending_count(pool, user_id).await?,
    })
}
