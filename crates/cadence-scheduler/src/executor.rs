//! Background execution: a bounded worker pool and the dispatch loop feeding it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::{ExecutorConfig, SchedulerConfig};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::service::SchedulerService;
use crate::types::JobStatus;

/// A unit of blocking work handed to the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Elastic pool of blocking workers behind a bounded queue.
///
/// Keeps at least `min_threads` workers, grows to `max_threads` while queued
/// and running tasks outnumber the workers, and retires extra workers after
/// `keep_alive` idle time. Must be created inside a Tokio runtime.
pub struct WorkerPool {
    tx: mpsc::Sender<Task>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    workers: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
    /// Tasks accepted and not yet finished, queued or running.
    pending: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    runtime: Handle,
    min_threads: usize,
    max_threads: usize,
    keep_alive: Duration,
}

impl WorkerPool {
    pub fn new(
        min_threads: usize,
        max_threads: usize,
        queue_capacity: usize,
        keep_alive: Duration,
    ) -> Result<Self> {
        if max_threads == 0 || min_threads > max_threads {
            return Err(SchedulerError::InvalidArgument(format!(
                "worker pool needs 0 <= min ({min_threads}) <= max ({max_threads}) and max > 0"
            )));
        }
        if queue_capacity == 0 {
            return Err(SchedulerError::InvalidArgument(
                "worker pool queue capacity must be positive".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(queue_capacity);
        let pool = Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Arc::new(AtomicUsize::new(0)),
            busy: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
            runtime: Handle::current(),
            min_threads,
            max_threads,
            keep_alive,
        };
        for _ in 0..min_threads {
            pool.spawn_worker();
        }
        Ok(pool)
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        Self::new(
            config.min_threads,
            config.max_threads,
            config.queue_capacity,
            Duration::from_secs(config.keep_alive_secs),
        )
    }

    /// Queue a task without blocking. Hands the task back when the queue is
    /// full or the pool is shut down.
    pub fn submit(&self, task: Task) -> std::result::Result<(), Task> {
        let outstanding = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        match self.tx.try_send(task) {
            Ok(()) => {
                let workers = self.workers.load(Ordering::SeqCst);
                if outstanding > workers && workers < self.max_threads {
                    self.spawn_worker();
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(task))
            | Err(mpsc::error::TrySendError::Closed(task)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Err(task)
            }
        }
    }

    /// Whether a submit right now would be accepted.
    pub fn has_capacity(&self) -> bool {
        !self.tx.is_closed() && self.tx.capacity() > 0
    }

    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Stop accepting work, let queued tasks drain, and wait for every worker.
    pub async fn shutdown(self) {
        let WorkerPool { tx, handles, .. } = self;
        drop(tx);
        let handles = std::mem::take(&mut *handles.lock().expect("worker handles poisoned"));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("worker task ended abnormally: {e}");
            }
        }
    }

    fn spawn_worker(&self) {
        let id = self.workers.fetch_add(1, Ordering::SeqCst) + 1;
        let rx = Arc::clone(&self.rx);
        let workers = Arc::clone(&self.workers);
        let busy = Arc::clone(&self.busy);
        let pending = Arc::clone(&self.pending);
        let min_threads = self.min_threads;
        let keep_alive = self.keep_alive;

        let handle = self.runtime.spawn(async move {
            debug!(worker = id, "worker started");
            loop {
                let next = {
                    let mut rx = rx.lock().await;
                    tokio::time::timeout(keep_alive, rx.recv()).await
                };
                let task = match next {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        workers.fetch_sub(1, Ordering::SeqCst);
                        break;
                    }
                    Err(_) => {
                        if retire(&workers, min_threads) {
                            debug!(worker = id, "idle worker retired");
                            break;
                        }
                        continue;
                    }
                };
                busy.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = tokio::task::spawn_blocking(task).await {
                    error!(worker = id, "task panicked: {e}");
                }
                busy.fetch_sub(1, Ordering::SeqCst);
                pending.fetch_sub(1, Ordering::SeqCst);
            }
        });

        let mut handles = self.handles.lock().expect("worker handles poisoned");
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}

/// Decrement the worker count unless that would drop below `min`.
fn retire(workers: &AtomicUsize, min: usize) -> bool {
    workers
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > min).then(|| n - 1))
        .is_ok()
}

/// What one dispatch tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs claimed and handed to the pool.
    pub dispatched: usize,
    /// `UNSCHEDULED` jobs that got a next-execution time (or were failed).
    pub scheduled: usize,
    /// Whether the tick stopped early because the pool was full.
    pub deferred: bool,
}

/// Drives the scheduler: schedules new jobs, claims due ones and runs them
/// on the worker pool until told to shut down.
pub struct BackgroundExecutor {
    service: Arc<SchedulerService>,
    pool: WorkerPool,
    tick_interval: Duration,
}

impl BackgroundExecutor {
    pub fn new(service: Arc<SchedulerService>, pool: WorkerPool, tick_interval: Duration) -> Self {
        Self {
            service,
            pool,
            tick_interval,
        }
    }

    pub fn from_config(
        service: Arc<SchedulerService>,
        scheduler: &SchedulerConfig,
        executor: &ExecutorConfig,
    ) -> Result<Self> {
        let pool = WorkerPool::from_config(executor)?;
        Ok(Self::new(
            service,
            pool,
            Duration::from_secs(scheduler.tick_interval_secs),
        ))
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Return jobs this instance left `EXECUTING` (e.g. after a crash) to the
    /// waiting state. Locks held by other instances are untouched.
    pub fn startup(&self) -> Result<usize> {
        self.service
            .reset_locks(JobStatus::Executing, JobStatus::Scheduled)
    }

    /// One dispatch pass: claim and submit due jobs until none are left or the
    /// pool is full, then schedule the unscheduled backlog. Never waits on a
    /// running job.
    pub fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        loop {
            if !self.pool.has_capacity() {
                report.deferred = true;
                break;
            }
            let Some(job) = self.service.claim_next_due()? else {
                break;
            };

            let service = Arc::clone(&self.service);
            let claimed = job.clone();
            let task: Task = Box::new(move || {
                if let Err(e) = service.run_claimed(&claimed) {
                    error!(job_id = %claimed.id, code = e.code(), "recording job outcome failed: {e}");
                }
            });

            if self.pool.submit(task).is_err() {
                // Claimed but never started: hand it back for the next tick.
                self.service.return_claim(&job)?;
                report.deferred = true;
                break;
            }
            report.dispatched += 1;
        }

        while self.service.schedule_next_unscheduled()? {
            report.scheduled += 1;
        }

        if report.deferred {
            warn!(
                dispatched = report.dispatched,
                workers = self.pool.worker_count(),
                "worker pool saturated; remaining due jobs deferred to next tick"
            );
        }
        Ok(report)
    }

    /// Main loop. Ticks every `tick_interval` until `shutdown` broadcasts `true`,
    /// then waits for in-flight jobs to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance = %self.service.instance_name(),
            tick_secs = self.tick_interval.as_secs(),
            "background executor started"
        );
        if let Err(e) = self.startup() {
            error!(code = e.code(), "lock reset on startup failed: {e}");
        }

        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick() {
                        Ok(report) if report.dispatched > 0 || report.scheduled > 0 => {
                            debug!(?report, "tick complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!(code = e.code(), "scheduler tick error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("background executor shutting down");
                        break;
                    }
                }
            }
        }
        self.pool.shutdown().await;
        info!("background executor stopped");
    }
}
