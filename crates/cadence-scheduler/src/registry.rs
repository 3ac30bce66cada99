use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::types::JobExecutionContext;

/// The execution contract every job implementation satisfies.
///
/// Implementations may block for as long as they need; they run on the
/// worker pool, never on the dispatch loop.
pub trait JobHandler: Send + Sync {
    fn execute(&self, ctx: &JobExecutionContext) -> anyhow::Result<()>;
}

type JobFactory = Arc<dyn Fn() -> Box<dyn JobHandler> + Send + Sync>;

/// Maps a job's `job_class` string to a factory producing its handler.
///
/// Populated once at startup; a single registry should be shared across the
/// process (pass as `Arc<JobRegistry>`).
#[derive(Default)]
pub struct JobRegistry {
    factories: RwLock<HashMap<String, JobFactory>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `job_class`, replacing any previous one.
    pub fn register<F>(&self, job_class: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn JobHandler> + Send + Sync + 'static,
    {
        let job_class = job_class.into();
        debug!(%job_class, "job class registered");
        self.factories
            .write()
            .expect("job registry poisoned")
            .insert(job_class, Arc::new(factory));
    }

    /// Register a handler type built with `Default` for every execution.
    pub fn register_default<J>(&self, job_class: impl Into<String>)
    where
        J: JobHandler + Default + 'static,
    {
        self.register(job_class, || Box::new(J::default()) as Box<dyn JobHandler>);
    }

    /// Register a plain function or closure as a handler.
    pub fn register_fn<F>(&self, job_class: impl Into<String>, f: F)
    where
        F: Fn(&JobExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(job_class, move || {
            Box::new(FnJob(Arc::clone(&f))) as Box<dyn JobHandler>
        });
    }

    /// Build a fresh handler for `job_class`, or None if nothing is registered.
    pub fn resolve(&self, job_class: &str) -> Option<Box<dyn JobHandler>> {
        let factory = self
            .factories
            .read()
            .expect("job registry poisoned")
            .get(job_class)
            .cloned()?;
        Some(factory())
    }

    pub fn contains(&self, job_class: &str) -> bool {
        self.factories
            .read()
            .expect("job registry poisoned")
            .contains_key(job_class)
    }

    /// Registered job classes, sorted.
    pub fn job_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .factories
            .read()
            .expect("job registry poisoned")
            .keys()
            .cloned()
            .collect();
        classes.sort();
        classes
    }
}

struct FnJob<F>(Arc<F>);

impl<F> JobHandler for FnJob<F>
where
    F: Fn(&JobExecutionContext) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &JobExecutionContext) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}
