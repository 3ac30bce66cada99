//! The scheduler service: job CRUD plus the claim / execute / release cycle.
//!
//! Every state transition runs inside its own `BEGIN IMMEDIATE` transaction,
//! which takes SQLite's write lock up front. Two instances racing for the
//! same due job therefore serialise on the lock, and the loser re-reads the
//! row after the winner committed and sees it is no longer due.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use cadence_core::config::{SchedulerConfig, MAX_RETRY_DELAY_SECS};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::pattern::SchedulingPattern;
use crate::predictor::next_matching_instant;
use crate::registry::JobRegistry;
use crate::store;
use crate::types::{
    Job, JobExecutionContext, JobParameter, JobStatus, MAX_PARAMETER_VALUE_CHARS,
};

/// Owns one SQLite connection and the in-process side of the job state machine.
///
/// Share across the dispatch loop and the worker pool as `Arc<SchedulerService>`.
/// Job bodies never run while the connection mutex is held.
pub struct SchedulerService {
    conn: Mutex<Connection>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    instance_name: String,
    retry_delay: Duration,
    max_execution_attempts: u32,
}

impl SchedulerService {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(
        conn: Connection,
        registry: Arc<JobRegistry>,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        init_db(&conn)?;
        if config.instance_name.trim().is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "instance name must not be empty".into(),
            ));
        }
        let retry_delay = i64::try_from(config.retry_delay_secs)
            .ok()
            .filter(|_| config.retry_delay_secs <= MAX_RETRY_DELAY_SECS)
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                SchedulerError::InvalidArgument(format!(
                    "retry delay {}s exceeds the maximum of {MAX_RETRY_DELAY_SECS}s",
                    config.retry_delay_secs
                ))
            })?;
        Ok(Self {
            conn: Mutex::new(conn),
            registry,
            clock: Arc::new(SystemClock),
            instance_name: config.instance_name.clone(),
            retry_delay,
            max_execution_attempts: config.max_execution_attempts.max(1),
        })
    }

    /// Replace the time source (tests pin it with a `ManualClock`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn maximum_execution_attempts(&self) -> u32 {
        self.max_execution_attempts
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn db(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("scheduler connection poisoned")
    }

    // -----------------------------------------------------------------------
    // Job CRUD
    // -----------------------------------------------------------------------

    /// Persist a new job. Once-off jobs without a next-execution time are due now.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn create_job(&self, job: &Job) -> Result<()> {
        validate_job(job)?;
        let now = self.clock.now();

        let mut row = job.clone();
        row.lock_name = None;
        row.execution_attempts = 0;
        row.last_executed = None;
        row.created = now;
        row.updated = now;
        if row.once_off || row.status == JobStatus::OnceOff {
            row.once_off = true;
            row.status = JobStatus::OnceOff;
            row.next_execution.get_or_insert(now);
        } else {
            match row.status {
                JobStatus::Unscheduled => row.next_execution = None,
                JobStatus::Scheduled if row.next_execution.is_none() => {
                    row.status = JobStatus::Unscheduled;
                }
                JobStatus::Scheduled => {}
                other => {
                    return Err(SchedulerError::InvalidArgument(format!(
                        "new jobs must be unscheduled, scheduled or once_off, not {other}"
                    )))
                }
            }
        }

        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        store::insert_job(&tx, &row)?;
        tx.commit()?;
        info!(name = %row.name, status = %row.status, "job created");
        Ok(())
    }

    /// Replace a job's name, pattern, class, enabled flag and parameters.
    ///
    /// A changed pattern sends a waiting job back to `UNSCHEDULED`; an executing
    /// job picks the new pattern up when it is rescheduled after the run.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn update_job(&self, job: &Job) -> Result<()> {
        validate_job(job)?;
        let now = self.clock.now();

        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = store::get_job(&tx, &job.id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: job.id.clone() })?;

        store::update_job_definition(&tx, job, now)?;
        if existing.scheduling_pattern.trim() != job.scheduling_pattern.trim()
            && store::mark_unscheduled(&tx, &job.id, now)? > 0
        {
            debug!("scheduling pattern changed; job will be rescheduled");
        }

        for old in &existing.parameters {
            if job.parameter(&old.name).is_none() {
                store::delete_parameter(&tx, &job.id, &old.name)?;
            }
        }
        for p in &job.parameters {
            store::upsert_parameter(&tx, &job.id, &p.name, &p.value, now)?;
        }
        tx.commit()?;
        info!("job updated");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn delete_job(&self, id: &str) -> Result<()> {
        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if store::delete_job(&tx, id)? == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        tx.commit()?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Look up a job by ID. Absence is `Ok(None)`, not an error.
    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        store::get_job(&self.db(), id)
    }

    /// All jobs ordered by name.
    pub fn get_jobs(&self) -> Result<Vec<Job>> {
        store::list_jobs(&self.db())
    }

    pub fn get_job_parameters(&self, id: &str) -> Result<Vec<JobParameter>> {
        let conn = self.db();
        if !store::job_exists(&conn, id)? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        store::get_parameters(&conn, id)
    }

    /// Insert or replace one parameter (last write wins).
    #[instrument(skip(self, value))]
    pub fn set_job_parameter(&self, id: &str, name: &str, value: &str) -> Result<()> {
        validate_parameter(name, value)?;
        let now = self.clock.now();
        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !store::job_exists(&tx, id)? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        store::upsert_parameter(&tx, id, name, value, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove one parameter. Returns whether it existed.
    #[instrument(skip(self))]
    pub fn remove_job_parameter(&self, id: &str, name: &str) -> Result<bool> {
        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !store::job_exists(&tx, id)? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        let removed = store::delete_parameter(&tx, id, name)? > 0;
        tx.commit()?;
        Ok(removed)
    }

    /// Administrative status override (e.g. `ABORTED`). Does not interrupt a
    /// running job; the run keeps this status when it finishes.
    #[instrument(skip(self))]
    pub fn set_job_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let now = self.clock.now();
        if store::set_status(&self.db(), id, status, now)? == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, %status, "job status set");
        Ok(())
    }

    /// Clear the lock on a job and move it to `status`.
    #[instrument(skip(self))]
    pub fn unlock_job(&self, id: &str, status: JobStatus) -> Result<()> {
        let now = self.clock.now();
        if store::set_status_unlocked(&self.db(), id, status, now)? == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        debug!(job_id = %id, %status, "job unlocked");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduling core
    // -----------------------------------------------------------------------

    /// Claim the oldest due job: lock it for this instance, bump its attempt
    /// counter and stamp `last_executed`. Returns a detached copy, or `None`
    /// when nothing is due.
    pub fn claim_next_due(&self) -> Result<Option<Job>> {
        let now = self.clock.now();
        let retry_cutoff = now
            .checked_sub_signed(self.retry_delay)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut job) = store::select_next_due(&tx, now, retry_cutoff)? else {
            return Ok(None);
        };
        if store::mark_executing(&tx, &job.id, &self.instance_name, now)? == 0 {
            return Ok(None);
        }
        tx.commit()?;

        job.status = JobStatus::Executing;
        job.lock_name = Some(self.instance_name.clone());
        job.execution_attempts += 1;
        job.previous_executed = job.last_executed.replace(now);
        job.updated = now;
        info!(
            job_id = %job.id,
            name = %job.name,
            attempt = job.execution_attempts,
            instance = %self.instance_name,
            "job claimed"
        );
        Ok(Some(job))
    }

    /// Hand back a claimed job that was never started (the pool refused it).
    pub fn return_claim(&self, job: &Job) -> Result<bool> {
        let now = self.clock.now();
        let n = store::return_claim(
            &self.db(),
            &job.id,
            &self.instance_name,
            job.waiting_status(),
            job.previous_executed,
            now,
        )?;
        debug!(job_id = %job.id, returned = n > 0, "claim returned");
        Ok(n > 0)
    }

    /// Give one `UNSCHEDULED` job its first next-execution time. A job whose
    /// pattern does not parse moves to `FAILED` and is never retried.
    /// Returns whether a job was processed.
    pub fn schedule_next_unscheduled(&self) -> Result<bool> {
        let now = self.clock.now();
        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(job) = store::select_next_unscheduled(&tx)? else {
            return Ok(false);
        };

        match next_execution_for(&job.scheduling_pattern, now) {
            Ok(next) => {
                store::mark_scheduled(&tx, &job.id, next, now)?;
                info!(job_id = %job.id, name = %job.name, next_execution = %next, "job scheduled");
            }
            Err(e) => {
                store::set_status_unlocked(&tx, &job.id, JobStatus::Failed, now)?;
                error!(job_id = %job.id, name = %job.name, error = %e, "job cannot be scheduled; marked failed");
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Recompute `next_execution` from the stored pattern and set `SCHEDULED`
    /// with zero attempts.
    #[instrument(skip(self))]
    pub fn reschedule_job(&self, id: &str) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = store::get_job(&tx, id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        let next = next_execution_for(&job.scheduling_pattern, now)?;
        store::mark_scheduled(&tx, id, next, now)?;
        tx.commit()?;
        info!(job_id = %id, next_execution = %next, "job rescheduled");
        Ok(next)
    }

    /// Move every row locked by this instance in `from` to `to`, clearing the
    /// lock. Run once at startup to recover from a crash mid-execution.
    pub fn reset_locks(&self, from: JobStatus, to: JobStatus) -> Result<usize> {
        let now = self.clock.now();
        let n = store::reset_locks(&self.db(), &self.instance_name, from, to, now)?;
        if n > 0 {
            warn!(count = n, instance = %self.instance_name, %from, %to, "stale job locks reset");
        } else {
            debug!(instance = %self.instance_name, "no stale job locks");
        }
        Ok(n)
    }

    /// Resolve the job's handler and run it with a fresh execution context.
    ///
    /// Handler errors and panics both come back as `JobExecutionFailed`.
    pub fn execute(&self, job: &Job) -> Result<()> {
        let handler = self.registry.resolve(&job.job_class).ok_or_else(|| {
            SchedulerError::JobClassNotRegistered {
                job_class: job.job_class.clone(),
            }
        })?;
        let ctx = JobExecutionContext::for_job(job, self.clock.now());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx)));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!("job panicked: {}", panic_message(&payload))),
        };
        result.map_err(|source| SchedulerError::JobExecutionFailed {
            id: job.id.clone(),
            source,
        })
    }

    /// Release a successful run: once-off jobs become `EXECUTED`, recurring
    /// jobs are rescheduled from their current pattern with attempts reset.
    ///
    /// Returns the status written, or `None` if the row was changed underneath
    /// (aborted, reset or deleted) and only the lock was cleared.
    pub fn record_success(&self, job: &Job) -> Result<Option<JobStatus>> {
        let now = self.clock.now();
        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (status, next, reset) = if job.once_off {
            (JobStatus::Executed, None, false)
        } else {
            // Re-read: the pattern may have been edited during the run.
            let pattern = store::get_job(&tx, &job.id)?
                .map(|j| j.scheduling_pattern)
                .unwrap_or_else(|| job.scheduling_pattern.clone());
            match next_execution_for(&pattern, now) {
                Ok(next) => (JobStatus::Scheduled, Some(next), true),
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "cannot reschedule job; marked failed");
                    (JobStatus::Failed, None, false)
                }
            }
        };

        let written = self.release(&tx, job, status, next, reset, now)?;
        tx.commit()?;
        if let Some(status) = written {
            info!(job_id = %job.id, name = %job.name, %status, next_execution = ?next, "job executed");
        }
        Ok(written)
    }

    /// Release a failed run: retry later while attempts remain, otherwise
    /// move the job to `FAILED`.
    pub fn record_failure(&self, job: &Job, cause: &SchedulerError) -> Result<Option<JobStatus>> {
        let now = self.clock.now();
        let exhausted = job.execution_attempts >= self.max_execution_attempts;
        let status = if exhausted {
            JobStatus::Failed
        } else {
            job.waiting_status()
        };

        let mut conn = self.db();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let written = self.release(&tx, job, status, None, false, now)?;
        tx.commit()?;

        if written.is_some() {
            if exhausted {
                error!(
                    job_id = %job.id,
                    name = %job.name,
                    attempts = job.execution_attempts,
                    error = %cause,
                    "job failed and exhausted its execution attempts; marked failed"
                );
            } else {
                warn!(
                    job_id = %job.id,
                    name = %job.name,
                    attempts = job.execution_attempts,
                    max_attempts = self.max_execution_attempts,
                    error = %cause,
                    "job failed; will be retried"
                );
            }
        }
        Ok(written)
    }

    /// Execute a claimed job and record the outcome. This is the unit of work
    /// the worker pool runs; a failing job never affects other jobs.
    pub fn run_claimed(&self, job: &Job) -> Result<Option<JobStatus>> {
        debug!(job_id = %job.id, job_class = %job.job_class, "executing job");
        match self.execute(job) {
            Ok(()) => self.record_success(job),
            Err(e) => self.record_failure(job, &e),
        }
    }

    fn release(
        &self,
        conn: &Connection,
        job: &Job,
        status: JobStatus,
        next: Option<DateTime<Utc>>,
        reset_attempts: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<JobStatus>> {
        let n = store::release_execution(
            conn,
            &job.id,
            &self.instance_name,
            status,
            next,
            reset_attempts,
            now,
        )?;
        if n > 0 {
            return Ok(Some(status));
        }
        store::clear_own_lock(conn, &job.id, &self.instance_name, now)?;
        warn!(job_id = %job.id, "job changed while executing; keeping its current status");
        Ok(None)
    }
}

fn next_execution_for(pattern: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let pattern = SchedulingPattern::parse(pattern)?;
    next_matching_instant(&pattern, now)
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn validate_job(job: &Job) -> Result<()> {
    let required = [
        ("id", &job.id),
        ("name", &job.name),
        ("scheduling_pattern", &job.scheduling_pattern),
        ("job_class", &job.job_class),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(SchedulerError::InvalidArgument(format!("{field} is required")));
        }
    }
    let mut seen = std::collections::HashSet::new();
    for p in &job.parameters {
        validate_parameter(&p.name, &p.value)?;
        if !seen.insert(p.name.as_str()) {
            return Err(SchedulerError::InvalidArgument(format!(
                "duplicate parameter '{}'",
                p.name
            )));
        }
    }
    Ok(())
}

fn validate_parameter(name: &str, value: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SchedulerError::InvalidArgument(
            "parameter name is required".into(),
        ));
    }
    let len = value.chars().count();
    if len > MAX_PARAMETER_VALUE_CHARS {
        return Err(SchedulerError::InvalidArgument(format!(
            "parameter '{name}' is {len} chars (max {MAX_PARAMETER_VALUE_CHARS})"
        )));
    }
    Ok(())
}
