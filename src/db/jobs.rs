use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use tokio_rusqlite::rusqlite::{self, OptionalExtension};
use tokio_rusqlite::{Connection, params};

use super::{opt_ts, opt_u64, parse_ts, parsed, to_i64, ts};
use crate::core::{ActivityTotals, FailureKind, JobStatus, RetentionPolicy, SyncJob};

/// Upper bound for a single history page.
pub const MAX_LIST_LIMIT: u32 = 1000;

const JOB_COLUMNS: &str = "id, target_name, status, triggered_by, created_at, started_at,
        completed_at, bytes_transferred, files_transferred, error_message,
        failure_kind, exit_code";

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncJob> {
    let failure_kind = row
        .get::<_, Option<String>>(10)?
        .map(|raw| {
            raw.parse::<FailureKind>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    10,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()?;

    Ok(SyncJob {
        id: row.get(0)?,
        target: row.get(1)?,
        status: parsed(row, 2)?,
        origin: parsed(row, 3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?, 4)?,
        started_at: opt_ts(row, 5)?,
        completed_at: opt_ts(row, 6)?,
        bytes_transferred: opt_u64(row, 7)?,
        files_transferred: opt_u64(row, 8)?,
        output: None,
        error_message: row.get(9)?,
        failure_kind,
        exit_code: row.get(11)?,
    })
}

/// Record a newly created job.
pub async fn append(conn: &Connection, job: &SyncJob) -> Result<()> {
    let job = job.clone();
    conn.call(move |c| {
        c.execute(
            "INSERT INTO sync_jobs (id, target_name, status, triggered_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.id,
                job.target,
                job.status.as_str(),
                job.origin.to_string(),
                ts(job.created_at)
            ],
        )
    })
    .await?;

    Ok(())
}

/// `pending -> running`. Returns false if the job was not pending.
pub async fn mark_running(conn: &Connection, id: String, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn
        .call(move |c| {
            c.execute(
                "UPDATE sync_jobs SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, ts(at)],
            )
        })
        .await?;

    Ok(changed == 1)
}

/// Write a job's terminal state. Rows already terminal are left untouched;
/// returns false in that case.
pub async fn finish(conn: &Connection, job: &SyncJob) -> Result<bool> {
    let job = job.clone();
    let changed = conn
        .call(move |c| {
            c.execute(
                "UPDATE sync_jobs
                 SET status = ?2, started_at = COALESCE(started_at, ?3), completed_at = ?4,
                     bytes_transferred = ?5, files_transferred = ?6, output = ?7,
                     error_message = ?8, failure_kind = ?9, exit_code = ?10
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![
                    job.id,
                    job.status.as_str(),
                    job.started_at.map(ts),
                    job.completed_at.map(ts),
                    to_i64(job.bytes_transferred),
                    to_i64(job.files_transferred),
                    job.output,
                    job.error_message,
                    job.failure_kind.map(|k| k.as_str()),
                    job.exit_code
                ],
            )
        })
        .await?;

    Ok(changed == 1)
}

/// Full job record, including captured output.
pub async fn get(conn: &Connection, id: String) -> Result<Option<SyncJob>> {
    let job = conn
        .call(move |c| {
            c.query_row(
                &format!("SELECT {}, output FROM sync_jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                |row| {
                    let mut job = map_job(row)?;
                    job.output = row.get(12)?;
                    Ok(job)
                },
            )
            .optional()
        })
        .await?;

    Ok(job)
}

/// Newest-first history for one target, without captured output.
pub async fn list(conn: &Connection, target: String, limit: u32) -> Result<Vec<SyncJob>> {
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    let jobs = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {} FROM sync_jobs WHERE target_name = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map(params![target, limit], map_job)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

    Ok(jobs)
}

pub async fn count_with_status(conn: &Connection, target: String, status: JobStatus) -> Result<u64> {
    let count = conn
        .call(move |c| {
            c.query_row(
                "SELECT COUNT(*) FROM sync_jobs WHERE target_name = ?1 AND status = ?2",
                params![target, status.as_str()],
                |row| row.get::<_, i64>(0),
            )
        })
        .await?;

    Ok(count.max(0) as u64)
}

/// Jobs created at or after `since`, across all targets, newest first and
/// without captured output.
pub async fn recent(conn: &Connection, since: DateTime<Utc>, limit: u32) -> Result<Vec<SyncJob>> {
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    let jobs = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {} FROM sync_jobs WHERE created_at >= ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map(params![ts(since), limit], map_job)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

    Ok(jobs)
}

/// Per-status counts of jobs created at or after `since`, with transfer
/// totals summed over the completed ones.
pub async fn activity(conn: &Connection, since: DateTime<Utc>) -> Result<ActivityTotals> {
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT status, COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'completed' THEN bytes_transferred END), 0),
                        COALESCE(SUM(CASE WHEN status = 'completed' THEN files_transferred END), 0)
                 FROM sync_jobs WHERE created_at >= ?1
                 GROUP BY status",
            )?;
            let rows = stmt.query_map(params![ts(since)], |row| {
                Ok((
                    parsed::<JobStatus>(row, 0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

    let mut totals = ActivityTotals::empty();
    for (status, count, bytes, files) in rows {
        let count = count.max(0) as u64;
        totals.by_status.insert(status.as_str().to_string(), count);
        totals.total_jobs += count;
        totals.bytes_transferred += bytes.max(0) as u64;
        totals.files_transferred += files.max(0) as u64;
    }

    Ok(totals)
}

/// Fail every job a previous process left unfinished.
pub async fn recover_interrupted(conn: &Connection, reason: String, at: DateTime<Utc>) -> Result<usize> {
    let recovered = conn
        .call(move |c| {
            c.execute(
                "UPDATE sync_jobs
                 SET status = 'failed', completed_at = ?2, error_message = ?1,
                     failure_kind = 'interrupted'
                 WHERE status IN ('pending', 'running')",
                params![reason, ts(at)],
            )
        })
        .await?;

    Ok(recovered)
}

/// Delete finished jobs outside the retention policy. Unfinished jobs are
/// never pruned. Returns the number of rows removed.
pub async fn prune(conn: &Connection, policy: RetentionPolicy, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = match policy.older_than_days {
        Some(days) => Some(
            Duration::try_days(i64::from(days))
                .and_then(|age| now.checked_sub_signed(age))
                .ok_or_else(|| anyhow!("retention age of {} days is out of range", days))?,
        ),
        None => None,
    };

    let removed = conn
        .call(move |c| {
            let tx = c.transaction()?;
            let mut removed = 0;

            if let Some(cutoff) = cutoff {
                removed += tx.execute(
                    "DELETE FROM sync_jobs
                     WHERE status IN ('completed', 'failed') AND created_at < ?1",
                    params![ts(cutoff)],
                )?;
            }

            if let Some(keep) = policy.keep_per_target {
                removed += tx.execute(
                    "DELETE FROM sync_jobs WHERE id IN (
                         SELECT id FROM (
                             SELECT id, ROW_NUMBER() OVER (
                                 PARTITION BY target_name ORDER BY created_at DESC, id DESC
                             ) AS rn
                             FROM sync_jobs
                             WHERE status IN ('completed', 'failed')
                         ) WHERE rn > ?1
                     )",
                    params![keep],
                )?;
            }

            tx.commit()?;
            Ok::<_, rusqlite::Error>(removed)
        })
        .await?;

    Ok(removed)
}
