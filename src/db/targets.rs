use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};
use tokio_rusqlite::{Connection, params};

use super::{opt_ts, opt_u64, parse_ts, parsed, to_i64, ts};
use crate::core::{MirrorTarget, NewTarget, TargetStatus};

const SELECT_TARGET: &str = "SELECT name, kind, upstream_url, local_path, enabled, status,
        last_sync_started, last_sync_completed, last_sync_error,
        total_size_bytes, file_count, created_at, updated_at
     FROM targets";

/// What a finished run records on its target, besides the status.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Set only when the run succeeded.
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub total_size_bytes: Option<u64>,
    pub file_count: Option<u64>,
}

fn map_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<MirrorTarget> {
    Ok(MirrorTarget {
        name: row.get(0)?,
        kind: row.get(1)?,
        upstream_url: row.get(2)?,
        local_path: PathBuf::from(row.get::<_, String>(3)?),
        enabled: row.get(4)?,
        status: parsed(row, 5)?,
        last_sync_started: opt_ts(row, 6)?,
        last_sync_completed: opt_ts(row, 7)?,
        last_sync_error: row.get(8)?,
        total_size_bytes: opt_u64(row, 9)?,
        file_count: opt_u64(row, 10)?,
        created_at: parse_ts(&row.get::<_, String>(11)?, 11)?,
        updated_at: parse_ts(&row.get::<_, String>(12)?, 12)?,
    })
}

/// Insert a declared target unless one with the same name exists.
/// Returns whether a row was inserted.
pub async fn insert_if_missing(conn: &Connection, target: NewTarget) -> Result<bool> {
    let inserted = conn
        .call(move |c| {
            let now = ts(Utc::now());
            let status = if target.enabled {
                TargetStatus::Active
            } else {
                TargetStatus::Disabled
            };
            c.execute(
                "INSERT INTO targets (name, kind, upstream_url, local_path, enabled, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(name) DO NOTHING",
                params![
                    target.name,
                    target.kind,
                    target.upstream_url,
                    target.local_path.to_string_lossy(),
                    target.enabled,
                    status.as_str(),
                    now
                ],
            )
        })
        .await?;

    Ok(inserted > 0)
}

pub async fn get(conn: &Connection, name: String) -> Result<Option<MirrorTarget>> {
    let target = conn
        .call(move |c| {
            c.query_row(
                &format!("{} WHERE name = ?1", SELECT_TARGET),
                params![name],
                map_target,
            )
            .optional()
        })
        .await?;

    Ok(target)
}

pub async fn list(conn: &Connection) -> Result<Vec<MirrorTarget>> {
    let targets = conn
        .call(|c| {
            let mut stmt = c.prepare(&format!("{} ORDER BY name", SELECT_TARGET))?;
            let rows = stmt.query_map([], map_target)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

    Ok(targets)
}

/// Flip a target to `syncing`. Only the lock manager calls this.
pub async fn mark_syncing(conn: &Connection, name: String, at: DateTime<Utc>) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE targets SET status = 'syncing', last_sync_started = ?2, updated_at = ?2
             WHERE name = ?1",
            params![name, ts(at)],
        )
    })
    .await?;

    Ok(())
}

/// Move a target out of `syncing`. A target disabled while it was syncing
/// lands on `disabled` regardless of `status`. Returns the stored status.
pub async fn release_status(
    conn: &Connection,
    name: String,
    status: TargetStatus,
) -> Result<Option<TargetStatus>> {
    let landed = conn
        .call(move |c| {
            c.query_row(
                "UPDATE targets
                 SET status = CASE WHEN enabled = 0 THEN 'disabled' ELSE ?2 END,
                     updated_at = ?3
                 WHERE name = ?1
                 RETURNING status",
                params![name, status.as_str(), ts(Utc::now())],
                |row| parsed::<TargetStatus>(row, 0),
            )
            .optional()
        })
        .await?;

    Ok(landed)
}

/// Record the result of a finished run. Leaves `status` alone.
pub async fn record_outcome(conn: &Connection, name: String, outcome: SyncOutcome) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE targets
             SET last_sync_completed = COALESCE(?2, last_sync_completed),
                 last_sync_error = ?3,
                 total_size_bytes = COALESCE(?4, total_size_bytes),
                 file_count = COALESCE(?5, file_count),
                 updated_at = ?6
             WHERE name = ?1",
            params![
                name,
                outcome.completed_at.map(ts),
                outcome.error,
                to_i64(outcome.total_size_bytes),
                to_i64(outcome.file_count),
                ts(Utc::now())
            ],
        )
    })
    .await?;

    Ok(())
}

/// Apply an administrative change. Toggling `enabled` moves the status
/// between `disabled` and `active`, except while syncing: then the running
/// job settles the status when it releases its lock.
pub async fn update_admin(
    conn: &Connection,
    name: String,
    upstream_url: Option<String>,
    enabled: Option<bool>,
) -> Result<Option<MirrorTarget>> {
    let target = conn
        .call(move |c| {
            let tx = c.transaction()?;
            let changed = tx.execute(
                "UPDATE targets
                 SET upstream_url = COALESCE(?2, upstream_url),
                     enabled = COALESCE(?3, enabled),
                     status = CASE
                         WHEN status = 'syncing' THEN status
                         WHEN COALESCE(?3, enabled) = 0 THEN 'disabled'
                         WHEN status = 'disabled' THEN 'active'
                         ELSE status
                     END,
                     updated_at = ?4
                 WHERE name = ?1",
                params![name, upstream_url, enabled, ts(Utc::now())],
            )?;

            let target = if changed == 0 {
                None
            } else {
                Some(tx.query_row(
                    &format!("{} WHERE name = ?1", SELECT_TARGET),
                    params![name],
                    map_target,
                )?)
            };
            tx.commit()?;
            Ok::<_, rusqlite::Error>(target)
        })
        .await?;

    Ok(target)
}

/// After a crash no lock is held, so no target may still claim `syncing`.
pub async fn recover_syncing(conn: &Connection, reason: String) -> Result<usize> {
    let recovered = conn
        .call(move |c| {
            c.execute(
                "UPDATE targets
                 SET status = CASE WHEN enabled = 0 THEN 'disabled' ELSE 'error' END,
                     last_sync_error = ?1,
                     updated_at = ?2
                 WHERE status = 'syncing'",
                params![reason, ts(Utc::now())],
            )
        })
        .await?;

    Ok(recovered)
}
