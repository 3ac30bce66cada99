use cadence_scheduler::{JobExecutionContext, JobHandler};
use tracing::{info, warn};

pub const LOG_JOB_CLASS: &str = "cadence.log";

/// Writes its parameters to the log. `message` is the log line, `level`
/// may be `warn`; `fail` makes the run fail with that text.
#[derive(Debug, Default)]
pub struct LogJob;

impl JobHandler for LogJob {
    fn execute(&self, ctx: &JobExecutionContext) -> anyhow::Result<()> {
        if let Some(reason) = ctx.parameter("fail") {
            anyhow::bail!("{reason}");
        }
        let message = ctx.parameter("message").unwrap_or("tick");
        let params = ctx.parameters();
        match ctx.parameter("level") {
            Some("warn") => warn!(job_id = %ctx.job_id(), scheduled_at = %ctx.scheduled_at(), ?params, "{message}"),
            _ => info!(job_id = %ctx.job_id(), scheduled_at = %ctx.scheduled_at(), ?params, "{message}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> JobExecutionContext {
        let params: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        JobExecutionContext::new("log-1", Utc::now(), params)
    }

    #[test]
    fn logs_and_succeeds() {
        assert!(LogJob.execute(&ctx(&[("message", "hello")])).is_ok());
        assert!(LogJob.execute(&ctx(&[])).is_ok());
    }

    #[test]
    fn fail_parameter_fails_the_run() {
        let err = LogJob.execute(&ctx(&[("fail", "disk full")])).unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }
}
