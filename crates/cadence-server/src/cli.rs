use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cadence-server")]
#[command(about = "Cron-style job scheduler backed by SQLite", long_about = None)]
pub struct Args {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler until Ctrl-C (default).
    Run,
    /// Manage stored jobs.
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Print the next times a pattern fires.
    Predict {
        pattern: String,
        /// Start instant (RFC 3339); defaults to now.
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    List {
        /// Print the full job records as JSON.
        #[arg(long)]
        json: bool,
    },
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        pattern: String,
        #[arg(long = "class")]
        job_class: String,
        /// Parameter as `name=value`; repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        #[arg(long)]
        once_off: bool,
        #[arg(long)]
        disabled: bool,
    },
    Remove {
        id: String,
    },
    /// Set a job's status (e.g. `aborted`, `unscheduled`).
    Status {
        id: String,
        status: String,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_no_subcommand() {
        let args = Args::try_parse_from(["cadence-server"]).unwrap();
        assert!(args.command.is_none());
        assert!(args.config.is_none());
    }

    #[test]
    fn parses_jobs_add_with_params() {
        let args = Args::try_parse_from([
            "cadence-server",
            "--config",
            "/etc/cadence.toml",
            "jobs",
            "add",
            "--id",
            "r1",
            "--name",
            "Report",
            "--pattern",
            "0 2 * * *",
            "--class",
            "cadence.log",
            "--param",
            "message=a=b",
            "--param",
            "level=warn",
            "--once-off",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("/etc/cadence.toml"));
        match args.command {
            Some(Command::Jobs(JobsCommand::Add {
                id,
                params,
                once_off,
                disabled,
                ..
            })) => {
                assert_eq!(id, "r1");
                assert_eq!(
                    params,
                    vec![
                        ("message".to_string(), "a=b".to_string()),
                        ("level".to_string(), "warn".to_string())
                    ]
                );
                assert!(once_off);
                assert!(!disabled);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_jobs_list_json() {
        let args = Args::try_parse_from(["cadence-server", "jobs", "list", "--json"]).unwrap();
        assert!(matches!(
            args.command,
            Some(Command::Jobs(JobsCommand::List { json: true }))
        ));
    }

    #[test]
    fn rejects_malformed_param() {
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
        assert_eq!(parse_param("k=").unwrap(), ("k".into(), String::new()));
    }

    #[test]
    fn parses_predict() {
        let args = Args::try_parse_from([
            "cadence-server",
            "predict",
            "*/15 * * * *",
            "--from",
            "2025-03-10T10:07:00Z",
            "--count",
            "3",
        ])
        .unwrap();
        match args.command {
            Some(Command::Predict { pattern, from, count }) => {
                assert_eq!(pattern, "*/15 * * * *");
                assert_eq!(from.unwrap().to_rfc3339(), "2025-03-10T10:07:00+00:00");
                assert_eq!(count, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
