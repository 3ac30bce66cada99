//! Row-level access to the `jobs` and `job_parameters` tables.
//!
//! Every function takes a plain `&Connection`, so callers decide the
//! transaction boundary (a `rusqlite::Transaction` derefs to `Connection`).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{fmt_ts, parse_ts};
use crate::error::{Result, SchedulerError};
use crate::types::{Job, JobParameter, JobStatus};

const JOB_COLUMNS: &str = "id, name, scheduling_pattern, job_class, enabled, status,
    execution_attempts, lock_name, last_executed, next_execution, once_off, created, updated";

/// Map a SELECT row (column order from `JOB_COLUMNS`) to a Job without parameters.
fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status_text: String = row.get(5)?;
    let status = status_text
        .parse::<JobStatus>()
        .map_err(|e| conversion_error(5, e))?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        scheduling_pattern: row.get(2)?,
        job_class: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        status,
        execution_attempts: row.get(6)?,
        lock_name: row.get(7)?,
        last_executed: optional_ts(row, 8)?,
        previous_executed: None,
        next_execution: optional_ts(row, 9)?,
        once_off: row.get::<_, i64>(10)? != 0,
        parameters: Vec::new(),
        created: required_ts(row, 11)?,
        updated: required_ts(row, 12)?,
    })
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn optional_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_ts(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp: {s}"))))
        .transpose()
}

fn required_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp: {s}")))
}

fn with_parameters(conn: &Connection, mut job: Job) -> Result<Job> {
    job.parameters = get_parameters(conn, &job.id)?;
    Ok(job)
}

fn query_one(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Option<Job>> {
    let job = conn.query_row(sql, args, row_to_job).optional()?;
    job.map(|j| with_parameters(conn, j)).transpose()
}

pub fn job_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM jobs WHERE id = ?1", [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Insert a job row and its parameters. Fails with `DuplicateJob` if the ID is taken.
pub fn insert_job(conn: &Connection, job: &Job) -> Result<()> {
    if job_exists(conn, &job.id)? {
        return Err(SchedulerError::DuplicateJob { id: job.id.clone() });
    }
    conn.execute(
        "INSERT INTO jobs
         (id, name, scheduling_pattern, job_class, enabled, status, execution_attempts,
          lock_name, last_executed, next_execution, once_off, created, updated)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        params![
            job.id,
            job.name,
            job.scheduling_pattern,
            job.job_class,
            job.enabled as i64,
            job.status.as_str(),
            job.execution_attempts,
            job.lock_name,
            job.last_executed.map(fmt_ts),
            job.next_execution.map(fmt_ts),
            job.once_off as i64,
            fmt_ts(job.created),
            fmt_ts(job.updated),
        ],
    )?;
    for p in &job.parameters {
        upsert_parameter(conn, &job.id, &p.name, &p.value, job.updated)?;
    }
    Ok(())
}

/// Load a job by primary key. Returns None instead of an error when absent.
pub fn get_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    query_one(conn, &sql, [id])
}

pub fn list_jobs(conn: &Connection) -> Result<Vec<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY name, id");
    let jobs: Vec<Job> = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_job)?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    jobs.into_iter().map(|j| with_parameters(conn, j)).collect()
}

/// Persist the administrative fields of a job. Returns rows changed.
pub fn update_job_definition(conn: &Connection, job: &Job, now: DateTime<Utc>) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET name=?2, scheduling_pattern=?3, job_class=?4, enabled=?5, updated=?6
         WHERE id=?1",
        params![
            job.id,
            job.name,
            job.scheduling_pattern,
            job.job_class,
            job.enabled as i64,
            fmt_ts(now),
        ],
    )?;
    Ok(n)
}

/// Return a job to `UNSCHEDULED` so its pattern is re-evaluated.
pub fn mark_unscheduled(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET status='unscheduled', next_execution=NULL, execution_attempts=0, updated=?2
         WHERE id=?1 AND status <> 'executing' AND once_off = 0",
        params![id, fmt_ts(now)],
    )?;
    Ok(n)
}

pub fn delete_job(conn: &Connection, id: &str) -> Result<usize> {
    conn.execute("DELETE FROM job_parameters WHERE job_id = ?1", [id])?;
    let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
    Ok(n)
}

pub fn get_parameters(conn: &Connection, job_id: &str) -> Result<Vec<JobParameter>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, value FROM job_parameters WHERE job_id = ?1 ORDER BY name",
    )?;
    let params = stmt
        .query_map([job_id], |row| {
            Ok(JobParameter {
                name: row.get(0)?,
                value: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(params)
}

/// Insert or replace a parameter by name (last write wins).
pub fn upsert_parameter(
    conn: &Connection,
    job_id: &str,
    name: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let now = fmt_ts(now);
    conn.execute(
        "INSERT INTO job_parameters (job_id, name, value, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT (job_id, name) DO UPDATE SET value = excluded.value, updated = excluded.updated",
        params![job_id, name, value, now],
    )?;
    Ok(())
}

pub fn delete_parameter(conn: &Connection, job_id: &str, name: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM job_parameters WHERE job_id = ?1 AND name = ?2",
        params![job_id, name],
    )?;
    Ok(n)
}

/// Oldest due job eligible for a claim, if any.
///
/// A job that has already been attempted is only eligible again once its
/// last attempt is older than `retry_cutoff`.
pub fn select_next_due(
    conn: &Connection,
    now: DateTime<Utc>,
    retry_cutoff: DateTime<Utc>,
) -> Result<Option<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE enabled = 1
           AND status IN ('scheduled', 'once_off')
           AND next_execution IS NOT NULL AND next_execution <= ?1
           AND (execution_attempts = 0 OR last_executed IS NULL OR last_executed < ?2)
         ORDER BY next_execution, id
         LIMIT 1"
    );
    query_one(conn, &sql, params![fmt_ts(now), fmt_ts(retry_cutoff)])
}

pub fn select_next_unscheduled(conn: &Connection) -> Result<Option<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE status = 'unscheduled'
         ORDER BY created, id
         LIMIT 1"
    );
    query_one(conn, &sql, [])
}

/// Conditional `SCHEDULED|ONCE_OFF -> EXECUTING`. Returns rows changed (0 or 1).
pub fn mark_executing(
    conn: &Connection,
    id: &str,
    lock_name: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let now = fmt_ts(now);
    let n = conn.execute(
        "UPDATE jobs SET status='executing', lock_name=?2,
                execution_attempts=execution_attempts+1, last_executed=?3, updated=?3
         WHERE id=?1 AND status IN ('scheduled', 'once_off')",
        params![id, lock_name, now],
    )?;
    Ok(n)
}

/// Set `SCHEDULED` with a fresh next-execution time and zero attempts.
pub fn mark_scheduled(
    conn: &Connection,
    id: &str,
    next_execution: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET status='scheduled', next_execution=?2, execution_attempts=0, updated=?3
         WHERE id=?1",
        params![id, fmt_ts(next_execution), fmt_ts(now)],
    )?;
    Ok(n)
}

/// Administrative status change; leaves any lock in place.
pub fn set_status(conn: &Connection, id: &str, status: JobStatus, now: DateTime<Utc>) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET status=?2, updated=?3 WHERE id=?1",
        params![id, status.as_str(), fmt_ts(now)],
    )?;
    Ok(n)
}

/// Move a job to `status` and drop whatever lock it holds.
pub fn set_status_unlocked(
    conn: &Connection,
    id: &str,
    status: JobStatus,
    now: DateTime<Utc>,
) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET status=?2, lock_name=NULL, updated=?3 WHERE id=?1",
        params![id, status.as_str(), fmt_ts(now)],
    )?;
    Ok(n)
}

/// Finish an execution this instance still owns. Returns 0 if the row was
/// changed underneath (aborted or reset), in which case nothing is written.
pub fn release_execution(
    conn: &Connection,
    id: &str,
    lock_name: &str,
    status: JobStatus,
    next_execution: Option<DateTime<Utc>>,
    reset_attempts: bool,
    now: DateTime<Utc>,
) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET status=?3, lock_name=NULL,
                next_execution=COALESCE(?4, next_execution),
                execution_attempts=CASE WHEN ?5 THEN 0 ELSE execution_attempts END,
                updated=?6
         WHERE id=?1 AND status='executing' AND lock_name=?2",
        params![
            id,
            lock_name,
            status.as_str(),
            next_execution.map(fmt_ts),
            reset_attempts,
            fmt_ts(now),
        ],
    )?;
    Ok(n)
}

/// Undo a claim whose job never started: back to `status` with the attempt
/// counter decremented. Only applies while this instance still holds the lock.
pub fn return_claim(
    conn: &Connection,
    id: &str,
    lock_name: &str,
    status: JobStatus,
    previous_executed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET status=?3, lock_name=NULL,
                execution_attempts=MAX(execution_attempts-1, 0),
                last_executed=?4, updated=?5
         WHERE id=?1 AND status='executing' AND lock_name=?2",
        params![
            id,
            lock_name,
            status.as_str(),
            previous_executed.map(fmt_ts),
            fmt_ts(now)
        ],
    )?;
    Ok(n)
}

/// Drop this instance's lock on a row whose status was changed by someone else.
pub fn clear_own_lock(conn: &Connection, id: &str, lock_name: &str, now: DateTime<Utc>) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs SET lock_name=NULL, updated=?3 WHERE id=?1 AND lock_name=?2",
        params![id, lock_name, fmt_ts(now)],
    )?;
    Ok(n)
}

/// Bulk `from -> to` for rows locked by `lock_name`, clearing the lock.
/// Once-off rows sent back to `SCHEDULED` return to `ONCE_OFF` instead.
pub fn reset_locks(
    conn: &Connection,
    lock_name: &str,
    from: JobStatus,
    to: JobStatus,
    now: DateTime<Utc>,
) -> Result<usize> {
    let n = conn.execute(
        "UPDATE jobs
         SET status = CASE WHEN once_off = 1 AND ?3 = 'scheduled' THEN 'once_off' ELSE ?3 END,
             lock_name = NULL,
             updated = ?4
         WHERE lock_name = ?1 AND status = ?2",
        params![lock_name, from.as_str(), to.as_str(), fmt_ts(now)],
    )?;
    Ok(n)
}
