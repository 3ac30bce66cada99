use std::sync::Arc;

use anyhow::Context;
use cadence_core::config::{CadenceConfig, SeedJobConfig};
use cadence_scheduler::{
    BackgroundExecutor, Job, JobRegistry, JobStatus, Predictor, SchedulerError, SchedulerService,
    SchedulingPattern,
};
use clap::Parser;
use tracing::{info, warn};

mod cli;
mod log_job;

use cli::{Args, Command, JobsCommand};
use log_job::{LogJob, LOG_JOB_CLASS};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_server=info,cadence_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    // Pattern prediction needs neither config nor database.
    if let Some(Command::Predict {
        pattern,
        from,
        count,
    }) = &args.command
    {
        return predict(pattern, from.unwrap_or_else(chrono::Utc::now), *count);
    }

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load_or_default(config_path.as_deref())?;

    let service = Arc::new(open_service(&config)?);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(service, &config).await,
        Command::Jobs(cmd) => jobs(&service, cmd),
        Command::Predict { .. } => Ok(()),
    }
}

fn open_service(config: &CadenceConfig) -> anyhow::Result<SchedulerService> {
    let db_path = &config.database.path;
    config
        .database
        .ensure_parent_dir()
        .with_context(|| format!("creating directory for {db_path}"))?;
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)
        .with_context(|| format!("opening database {db_path}"))?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    db.busy_timeout(std::time::Duration::from_millis(
        config.database.busy_timeout_ms,
    ))?;

    let registry = JobRegistry::new();
    registry.register_default::<LogJob>(LOG_JOB_CLASS);

    Ok(SchedulerService::new(db, Arc::new(registry), &config.scheduler)?)
}

async fn run(service: Arc<SchedulerService>, config: &CadenceConfig) -> anyhow::Result<()> {
    seed_jobs(&service, &config.jobs);

    let executor =
        BackgroundExecutor::from_config(Arc::clone(&service), &config.scheduler, &config.executor)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine = tokio::spawn(executor.run(shutdown_rx));
    info!(
        instance = %service.instance_name(),
        job_classes = ?service.registry().job_classes(),
        "cadence scheduler running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    engine.await?;
    Ok(())
}

/// Create configured jobs that are not in the database yet.
fn seed_jobs(service: &SchedulerService, seeds: &[SeedJobConfig]) {
    for seed in seeds {
        let mut job = Job::new(&seed.id, &seed.name, &seed.scheduling_pattern, &seed.job_class);
        if seed.once_off {
            job = job.once_off();
        }
        if !seed.enabled {
            job = job.disabled();
        }
        for (name, value) in &seed.parameters {
            job = job.with_parameter(name, value);
        }
        match service.create_job(&job) {
            Ok(()) => info!(job_id = %seed.id, "seed job created"),
            Err(SchedulerError::DuplicateJob { .. }) => {}
            Err(e) => warn!(job_id = %seed.id, code = e.code(), "seed job rejected: {e}"),
        }
    }
}

fn jobs(service: &SchedulerService, cmd: JobsCommand) -> anyhow::Result<()> {
    match cmd {
        JobsCommand::List { json: true } => {
            println!("{}", serde_json::to_string_pretty(&service.get_jobs()?)?);
        }
        JobsCommand::List { json: false } => {
            for job in service.get_jobs()? {
                let next = job
                    .next_execution
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<24} {:<12} {:<20} {:<26} {}{}",
                    job.id,
                    job.status.as_str(),
                    job.scheduling_pattern,
                    next,
                    job.name,
                    if job.enabled { "" } else { " (disabled)" }
                );
            }
        }
        JobsCommand::Add {
            id,
            name,
            pattern,
            job_class,
            params,
            once_off,
            disabled,
        } => {
            SchedulingPattern::validate(&pattern)?;
            if !service.registry().contains(&job_class) {
                warn!(%job_class, "no implementation registered for this job class in this binary");
            }
            let mut job = Job::new(id, name, pattern, job_class);
            if once_off {
                job = job.once_off();
            }
            if disabled {
                job = job.disabled();
            }
            for (k, v) in params {
                job = job.with_parameter(k, v);
            }
            service.create_job(&job)?;
            println!("added {}", job.id);
        }
        JobsCommand::Remove { id } => {
            service.delete_job(&id)?;
            println!("removed {id}");
        }
        JobsCommand::Status { id, status } => {
            let status: JobStatus = status.parse().map_err(anyhow::Error::msg)?;
            service.set_job_status(&id, status)?;
            println!("{id} -> {status}");
        }
    }
    Ok(())
}

fn predict(pattern: &str, from: chrono::DateTime<chrono::Utc>, count: usize) -> anyhow::Result<()> {
    let pattern: SchedulingPattern = pattern.parse()?;
    let mut predictor = Predictor::new(pattern, from);
    for _ in 0..count {
        println!("{}", predictor.next_matching_instant()?.to_rfc3339());
    }
    Ok(())
}
