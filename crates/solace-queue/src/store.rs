//! Blocking SQL operations behind the broker.
//!
//! Every state transition is guarded by the job's current status and
//! attempt number inside an immediate transaction, so two callers racing on
//! the same job can never both win: the loser gets [`QueueError::StaleJob`].

use crate::error::QueueError;
use crate::job::{BackoffPolicy, FailOutcome, Job, JobOptions, NextJob, QueueCounts};
use crate::now_ms;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use solace_types::{JobStatus, QueueName};

/// Completed jobs are archived in batches of this size.
const PRUNE_BATCH: i64 = 5_000;

const JOB_COLUMNS: &str = "id, queue, payload_json, attempt, max_attempts, backoff_base_ms, \
                           backoff_cap_ms, status, enqueued_at_ms, run_at_ms, last_error";

/// Inserts a new waiting job and returns its id.
pub fn enqueue(
    conn: &Connection,
    queue: QueueName,
    payload: &serde_json::Value,
    options: &JobOptions,
) -> Result<i64, QueueError> {
    let now = now_ms();
    let run_at = now + options.delay.as_millis() as i64;
    let id = conn.query_row(
        "INSERT INTO jobs (
            queue, payload_json, max_attempts, backoff_base_ms, backoff_cap_ms,
            status, run_at_ms, enqueued_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, 'waiting', ?6, ?7)
        RETURNING id",
        params![
            queue.as_str(),
            serde_json::to_string(payload)?,
            options.max_attempts.max(1),
            options.backoff.base_ms as i64,
            options.backoff.cap_ms as i64,
            run_at,
            now,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Atomically claims the oldest due job of `queue`, marking it active and
/// starting its next attempt.
pub fn claim_next(conn: &mut Connection, queue: QueueName) -> Result<Option<Job>, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let sql = format!(
        "UPDATE jobs SET status = 'active', attempt = attempt + 1
         WHERE id = (
             SELECT id FROM jobs
             WHERE queue = ?1 AND status = 'waiting' AND run_at_ms <= ?2
             ORDER BY run_at_ms ASC, id ASC
             LIMIT 1
         ) AND status = 'waiting'
         RETURNING {JOB_COLUMNS}"
    );
    let job = tx
        .query_row(&sql, params![queue.as_str(), now_ms()], map_row_to_job)
        .optional()?;
    tx.commit()?;
    Ok(job)
}

/// Marks an active job completed and, in the same transaction, enqueues its
/// follow-up. Returns the follow-up job id.
pub fn complete(
    conn: &mut Connection,
    job_id: i64,
    attempt: u32,
    next: Option<(&NextJob, &JobOptions)>,
) -> Result<Option<i64>, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let updated = tx.execute(
        "UPDATE jobs SET status = 'completed', finished_at_ms = ?1, last_error = NULL
         WHERE id = ?2 AND status = 'active' AND attempt = ?3",
        params![now_ms(), job_id, attempt],
    )?;
    if updated == 0 {
        return Err(QueueError::StaleJob(job_id));
    }

    let next_id = match next {
        Some((next, options)) => Some(enqueue(&tx, next.queue, &next.payload, options)?),
        None => None,
    };
    tx.commit()?;
    Ok(next_id)
}

/// Records a failed attempt. Retryable failures with attempts left go back
/// to `waiting` after the backoff delay; everything else becomes dead.
pub fn fail(
    conn: &mut Connection,
    job_id: i64,
    attempt: u32,
    error: &str,
    retryable: bool,
) -> Result<FailOutcome, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row: Option<(u32, i64, i64)> = tx
        .query_row(
            "SELECT max_attempts, backoff_base_ms, backoff_cap_ms FROM jobs
             WHERE id = ?1 AND status = 'active' AND attempt = ?2",
            params![job_id, attempt],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((max_attempts, base_ms, cap_ms)) = row else {
        return Err(QueueError::StaleJob(job_id));
    };

    let now = now_ms();
    let outcome = if retryable && attempt < max_attempts {
        let backoff = BackoffPolicy {
            base_ms: base_ms.max(0) as u64,
            cap_ms: cap_ms.max(0) as u64,
        };
        let delay = backoff.delay_for(attempt.saturating_sub(1));
        tx.execute(
            "UPDATE jobs SET status = 'waiting', run_at_ms = ?1, last_error = ?2 WHERE id = ?3",
            params![now + delay.as_millis() as i64, error, job_id],
        )?;
        FailOutcome::Retrying { delay }
    } else {
        tx.execute(
            "UPDATE jobs SET status = 'failed', finished_at_ms = ?1, last_error = ?2 WHERE id = ?3",
            params![now, error, job_id],
        )?;
        FailOutcome::Dead
    };
    tx.commit()?;
    Ok(outcome)
}

/// Returns jobs left active by a crashed process to the queue.
///
/// A job whose interrupted attempt was its last goes straight to the dead
/// state so it never runs more than `max_attempts` times. Assumes a single
/// broker process per database.
pub fn requeue_stalled(conn: &mut Connection, queue: QueueName) -> Result<(usize, usize), QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_ms();
    let dead = tx.execute(
        "UPDATE jobs SET status = 'failed', finished_at_ms = ?1,
                last_error = 'stalled during final attempt'
         WHERE queue = ?2 AND status = 'active' AND attempt >= max_attempts",
        params![now, queue.as_str()],
    )?;
    let requeued = tx.execute(
        "UPDATE jobs SET status = 'waiting', run_at_ms = ?1
         WHERE queue = ?2 AND status = 'active'",
        params![now, queue.as_str()],
    )?;
    tx.commit()?;
    Ok((requeued, dead))
}

pub fn get_job(conn: &Connection, job_id: i64) -> Result<Option<Job>, QueueError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    Ok(conn.query_row(&sql, [job_id], map_row_to_job).optional()?)
}

pub fn counts(conn: &Connection, queue: QueueName) -> Result<QueueCounts, QueueError> {
    let counts = conn.query_row(
        "SELECT
            COALESCE(SUM(status = 'waiting' AND run_at_ms <= ?2), 0),
            COALESCE(SUM(status = 'waiting' AND run_at_ms > ?2), 0),
            COALESCE(SUM(status = 'active'), 0),
            COALESCE(SUM(status = 'completed'), 0),
            COALESCE(SUM(status = 'failed'), 0)
         FROM jobs WHERE queue = ?1",
        params![queue.as_str(), now_ms()],
        |row| {
            Ok(QueueCounts {
                waiting: row.get::<_, i64>(0)? as u64,
                delayed: row.get::<_, i64>(1)? as u64,
                active: row.get::<_, i64>(2)? as u64,
                completed: row.get::<_, i64>(3)? as u64,
                failed: row.get::<_, i64>(4)? as u64,
            })
        },
    )?;
    Ok(counts)
}

/// Lists dead jobs of a queue, most recent first.
pub fn list_dead(conn: &Connection, queue: QueueName, limit: u32) -> Result<Vec<Job>, QueueError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE queue = ?1 AND status = 'failed'
         ORDER BY finished_at_ms DESC, id DESC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![queue.as_str(), limit], map_row_to_job)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row?);
    }
    Ok(jobs)
}

/// Operator intervention: gives a dead job a fresh attempt budget.
/// Returns `false` if the job is not dead on that queue.
pub fn revive(conn: &Connection, queue: QueueName, job_id: i64) -> Result<bool, QueueError> {
    let updated = conn.execute(
        "UPDATE jobs SET status = 'waiting', attempt = 0, run_at_ms = ?1, finished_at_ms = NULL
         WHERE id = ?2 AND queue = ?3 AND status = 'failed'",
        params![now_ms(), job_id, queue.as_str()],
    )?;
    Ok(updated == 1)
}

/// Archives completed jobs that finished before `cutoff_ms`. Dead jobs are
/// kept for manual inspection.
pub fn prune_completed(conn: &Connection, cutoff_ms: i64) -> Result<usize, QueueError> {
    let mut total = 0;
    loop {
        let deleted = conn.execute(
            "DELETE FROM jobs WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'completed' AND finished_at_ms < ?1
                LIMIT ?2
            )",
            params![cutoff_ms, PRUNE_BATCH],
        )?;
        total += deleted;
        if (deleted as i64) < PRUNE_BATCH {
            break;
        }
    }
    Ok(total)
}

fn map_row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let conversion = |idx: usize, e: solace_types::ParseEnumError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    let queue: String = row.get(1)?;
    let payload_json: String = row.get(2)?;
    let status: String = row.get(7)?;

    Ok(Job {
        id: row.get(0)?,
        queue: queue.parse().map_err(|e| conversion(1, e))?,
        payload: serde_json::from_str(&payload_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        attempt: row.get(3)?,
        max_attempts: row.get(4)?,
        backoff: BackoffPolicy {
            base_ms: row.get::<_, i64>(5)?.max(0) as u64,
            cap_ms: row.get::<_, i64>(6)?.max(0) as u64,
        },
        status: status.parse::<JobStatus>().map_err(|e| conversion(7, e))?,
        enqueued_at_ms: row.get(8)?,
        run_at_ms: row.get(9)?,
        last_error: row.get(10)?,
    })
}
