use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a job parameter value, in characters.
pub const MAX_PARAMETER_VALUE_CHARS: usize = 4000;

/// Lifecycle state of a job.
///
/// ```text
/// UNSCHEDULED -> SCHEDULED -> EXECUTING -> EXECUTED | FAILED | ABORTED
///                    ^                         |
///                    +---- reschedule/retry ---+
/// ONCE_OFF -> EXECUTING -> EXECUTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for its first next-execution time.
    Unscheduled,
    /// Has a next-execution time and is waiting for it.
    Scheduled,
    /// Claimed and locked by one scheduler instance.
    Executing,
    /// Finished; only once-off jobs stay here.
    Executed,
    /// Pattern invalid, or execution attempts exhausted.
    Failed,
    /// Stopped by administrative action.
    Aborted,
    /// Runs at most once, then moves to `Executed`.
    OnceOff,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Unscheduled,
        JobStatus::Scheduled,
        JobStatus::Executing,
        JobStatus::Executed,
        JobStatus::Failed,
        JobStatus::Aborted,
        JobStatus::OnceOff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unscheduled => "unscheduled",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Executing => "executing",
            JobStatus::Executed => "executed",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
            JobStatus::OnceOff => "once_off",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase().replace('-', "_");
        JobStatus::ALL
            .iter()
            .find(|status| status.as_str() == lower)
            .copied()
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// A named string value attached to a job. `(job id, name)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub name: String,
    pub value: String,
}

impl JobParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Caller-chosen unique identifier.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Scheduling pattern text, parsed when the job is (re)scheduled.
    pub scheduling_pattern: String,
    /// Key into the [`JobRegistry`](crate::registry::JobRegistry).
    pub job_class: String,
    pub enabled: bool,
    pub status: JobStatus,
    /// Claims since the last successful reschedule.
    pub execution_attempts: u32,
    /// Identity of the scheduler instance holding the execution lock.
    pub lock_name: Option<String>,
    pub last_executed: Option<DateTime<Utc>>,
    /// `last_executed` as it was before the current claim. Only set on jobs
    /// returned by a claim; put back if the claim is handed back unrun.
    #[serde(skip)]
    pub(crate) previous_executed: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    /// True for jobs created as `ONCE_OFF`; never rescheduled after success.
    pub once_off: bool,
    /// Sorted by name.
    pub parameters: Vec<JobParameter>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Job {
    /// A new enabled, unscheduled job with no parameters.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        scheduling_pattern: impl Into<String>,
        job_class: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            scheduling_pattern: scheduling_pattern.into(),
            job_class: job_class.into(),
            enabled: true,
            status: JobStatus::Unscheduled,
            execution_attempts: 0,
            lock_name: None,
            last_executed: None,
            previous_executed: None,
            next_execution: None,
            once_off: false,
            parameters: Vec::new(),
            created: now,
            updated: now,
        }
    }

    /// Mark the job as once-off: it runs when due and then stays `EXECUTED`.
    pub fn once_off(mut self) -> Self {
        self.status = JobStatus::OnceOff;
        self.once_off = true;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let param = JobParameter::new(name, value);
        self.parameters.retain(|p| p.name != param.name);
        self.parameters.push(param);
        self
    }

    pub fn with_next_execution(mut self, at: DateTime<Utc>) -> Self {
        self.next_execution = Some(at);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// The state a claimed job returns to when it is released for retry.
    pub fn waiting_status(&self) -> JobStatus {
        if self.once_off {
            JobStatus::OnceOff
        } else {
            JobStatus::Scheduled
        }
    }
}

/// Read-only view handed to a job implementation for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExecutionContext {
    job_id: String,
    scheduled_at: DateTime<Utc>,
    parameters: BTreeMap<String, String>,
}

impl JobExecutionContext {
    pub fn new(
        job_id: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            scheduled_at,
            parameters,
        }
    }

    /// Build from a claimed job; `scheduled_at` falls back to `now` when the
    /// job carried no next-execution time.
    pub fn for_job(job: &Job, now: DateTime<Utc>) -> Self {
        let parameters = job
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        Self::new(job.id.clone(), job.next_execution.unwrap_or(now), parameters)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("ONCE-OFF".parse::<JobStatus>().unwrap(), JobStatus::OnceOff);
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn with_parameter_replaces_by_name() {
        let job = Job::new("j1", "Job", "* * * * *", "noop")
            .with_parameter("to", "a@example.com")
            .with_parameter("to", "b@example.com");
        assert_eq!(job.parameters.len(), 1);
        assert_eq!(job.parameter("to"), Some("b@example.com"));
    }

    #[test]
    fn once_off_builder_sets_status_and_flag() {
        let job = Job::new("j1", "Job", "* * * * *", "noop").once_off();
        assert_eq!(job.status, JobStatus::OnceOff);
        assert_eq!(job.waiting_status(), JobStatus::OnceOff);
    }

    #[test]
    fn context_copies_parameters() {
        let at = Utc::now();
        let job = Job::new("j1", "Job", "* * * * *", "noop")
            .with_parameter("a", "1")
            .with_next_execution(at);
        let ctx = JobExecutionContext::for_job(&job, at + chrono::Duration::minutes(5));
        assert_eq!(ctx.scheduled_at(), at);
        assert_eq!(ctx.parameter("a"), Some("1"));
        assert_eq!(ctx.parameter("b"), None);
    }
}
