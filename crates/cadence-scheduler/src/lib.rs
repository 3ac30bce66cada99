//! `cadence-scheduler`: cron-style job scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table with their parameters in
//! `job_parameters`. A [`service::SchedulerService`] owns the job state
//! machine; the [`executor::BackgroundExecutor`] ticks, schedules new jobs,
//! claims due ones under a pessimistic lock and runs them on a bounded
//! [`executor::WorkerPool`]. Several processes may share one database file:
//! each claim takes the SQLite write lock, so a job runs at most once per
//! due time.
//!
//! # Job lifecycle
//!
//! | Status        | Meaning                                              |
//! |---------------|------------------------------------------------------|
//! | `unscheduled` | Needs a next-execution time computed                 |
//! | `scheduled`   | Waiting for `next_execution`                         |
//! | `once_off`    | Waiting for its single run                           |
//! | `executing`   | Claimed by the instance named in `lock_name`         |
//! | `executed`    | Once-off job that has run                            |
//! | `aborted`     | Stopped by an administrator                          |
//! | `failed`      | Bad pattern or out of execution attempts             |
//!
//! # Patterns
//!
//! Five fields `minute hour day-of-month month day-of-week`, evaluated in UTC.
//! Fields accept `*`, numbers, names (`jan`, `mon`), ranges, lists and steps;
//! day-of-month accepts `L` for the last day. Alternatives are joined with `|`.

pub mod clock;
pub mod db;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod pattern;
pub mod predictor;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SchedulerError};
pub use executor::{BackgroundExecutor, TickReport, WorkerPool};
pub use pattern::SchedulingPattern;
pub use predictor::{next_matching_instant, Predictor};
pub use registry::{JobHandler, JobRegistry};
pub use service::SchedulerService;
pub use types::{Job, JobExecutionContext, JobParameter, JobStatus};
