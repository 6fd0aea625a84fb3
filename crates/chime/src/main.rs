//! Chime: recurring Hello World jobs
//!
//! Main binary with subcommands:
//! - `run`: Scheduler daemon
//! - `add`, `list`, `pause`, `resume`, `remove`: Job management
//! - `run-now`, `next`: Manual execution and schedule inspection
//! - `logs`, `stats`, `clear-logs`: Execution history

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chime_scheduler::{
    DEFAULT_LOG_CAPACITY, JobStatus, ScheduleConfig, ScheduleType, SchedulerConfig, Zone,
};

mod commands;
mod daemon;

use daemon::{DaemonConfig, DataPaths};

#[derive(Parser)]
#[command(name = "chime")]
#[command(about = "Recurring Hello World jobs", long_about = None)]
struct Cli {
    /// Directory holding jobs.json and executions.json
    #[arg(long, global = true, env = "CHIME_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Time zone schedules are evaluated in ("local" or "utc")
    #[arg(long, global = true, env = "CHIME_ZONE", default_value = "local")]
    zone: Zone,

    /// Number of executions kept in the log
    #[arg(long, global = true, env = "CHIME_LOG_CAPACITY", default_value_t = DEFAULT_LOG_CAPACITY)]
    log_capacity: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Run {
        /// Seconds between checks for job edits made by other commands
        #[arg(long, default_value = "5")]
        reload_interval: u64,

        /// Milliseconds to wait after a fire before arming the next one
        #[arg(long, default_value = "1000")]
        settle_delay_ms: u64,

        /// Milliseconds a job is shown as completed after it runs
        #[arg(long, default_value = "3000")]
        completed_display_ms: u64,
    },

    /// Create a job
    Add {
        /// Job name
        #[arg(long)]
        name: String,

        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,

        #[command(flatten)]
        schedule: ScheduleArgs,

        /// Time of day for --daily or --weekly (HH:MM)
        #[arg(long, value_name = "HH:MM")]
        time: Option<String>,
    },

    /// List jobs
    List,

    /// Pause a job
    Pause {
        /// Job id or unique id prefix
        id: String,
    },

    /// Resume a paused job
    Resume {
        /// Job id or unique id prefix
        id: String,
    },

    /// Delete a job
    Remove {
        /// Job id or unique id prefix
        id: String,
    },

    /// Execute a job immediately
    RunNow {
        /// Job id or unique id prefix
        id: String,
    },

    /// Show recent executions, newest first
    Logs {
        /// Only executions of this job
        #[arg(long)]
        job: Option<String>,

        /// Maximum number of entries
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show execution statistics for a job, or for the whole log
    Stats {
        /// Job id or unique id prefix
        id: Option<String>,
    },

    /// Delete all logged executions
    ClearLogs,

    /// Show when a job will next run
    Next {
        /// Job id or unique id prefix
        id: String,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ScheduleArgs {
    /// Run every hour at this minute (0-59)
    #[arg(long, value_name = "MINUTE")]
    hourly: Option<u32>,

    /// Run every day; takes the time of day (HH:MM)
    #[arg(long, value_name = "HH:MM", num_args = 0..=1, default_missing_value = "")]
    daily: Option<String>,

    /// Run every week on this day (0 = Sunday, 6 = Saturday)
    #[arg(long, value_name = "DAY")]
    weekly: Option<u32>,
}

impl ScheduleArgs {
    /// `--daily` accepts its time inline or through `--time`; both default to
    /// midnight.
    fn into_schedule(self, time: Option<String>) -> (ScheduleType, ScheduleConfig) {
        if let Some(minute) = self.hourly {
            return (ScheduleType::Hourly, ScheduleConfig::hourly(minute));
        }
        if let Some(day) = self.weekly {
            let time = time.unwrap_or_else(|| "00:00".to_string());
            return (ScheduleType::Weekly, ScheduleConfig::weekly(day, time));
        }
        let inline = self.daily.filter(|t| !t.is_empty());
        let time = inline.or(time).unwrap_or_else(|| "00:00".to_string());
        (ScheduleType::Daily, ScheduleConfig::daily(time))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("chime"))
        .unwrap_or_else(|| PathBuf::from(".chime"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "chime=info,chime_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let paths = DataPaths::new(&cli.data_dir.unwrap_or_else(default_data_dir));
    let config = SchedulerConfig {
        log_capacity: cli.log_capacity,
        ..SchedulerConfig::default()
    }
    .with_zone(cli.zone);

    match cli.command {
        Commands::Run {
            reload_interval,
            settle_delay_ms,
            completed_display_ms,
        } => {
            let config = DaemonConfig {
                paths,
                scheduler: SchedulerConfig {
                    completed_display: Duration::from_millis(completed_display_ms),
                    ..config
                }
                .with_settle_delay(Duration::from_millis(settle_delay_ms)),
                reload_interval: Duration::from_secs(reload_interval.max(1)),
            };
            daemon::run(config)
                .await
                .map_err(|e| miette::miette!("{}", e))
        }

        Commands::Add {
            name,
            description,
            schedule,
            time,
        } => {
            let (schedule_type, schedule_config) = schedule.into_schedule(time);
            commands::add(&paths, &name, &description, schedule_type, schedule_config)
                .map(|_| ())
        }

        Commands::List => commands::list(&paths, cli.zone),

        Commands::Pause { id } => {
            commands::set_status(&paths, &id, JobStatus::Paused).map(|_| ())
        }

        Commands::Resume { id } => {
            commands::set_status(&paths, &id, JobStatus::Active).map(|_| ())
        }

        Commands::Remove { id } => commands::remove(&paths, &id).map(|_| ()),

        Commands::RunNow { id } => commands::run_now(&paths, &config, &id).await.map(|_| ()),

        Commands::Logs { job, limit } => {
            commands::logs(&paths, cli.log_capacity, cli.zone, job.as_deref(), limit)
                .map(|_| ())
        }

        Commands::Stats { id } => {
            commands::stats(&paths, cli.log_capacity, cli.zone, id.as_deref())
        }

        Commands::ClearLogs => commands::clear_logs(&paths, cli.log_capacity).map(|_| ()),

        Commands::Next { id } => commands::next(&paths, cli.zone, &id).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("chime").chain(args.iter().copied())).unwrap()
    }

    fn add_schedule(args: &[&str]) -> (ScheduleType, ScheduleConfig) {
        match parse(args).command {
            Commands::Add { schedule, time, .. } => schedule.into_schedule(time),
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_add_schedules() {
        assert_eq!(
            add_schedule(&["add", "--name", "a", "--hourly", "30"]),
            (ScheduleType::Hourly, ScheduleConfig::hourly(30))
        );
        assert_eq!(
            add_schedule(&["add", "--name", "a", "--daily", "09:15"]),
            (ScheduleType::Daily, ScheduleConfig::daily("09:15"))
        );
        assert_eq!(
            add_schedule(&["add", "--name", "a", "--daily", "--time", "07:00"]),
            (ScheduleType::Daily, ScheduleConfig::daily("07:00"))
        );
        assert_eq!(
            add_schedule(&["add", "--name", "a", "--weekly", "3", "--time", "12:00"]),
            (ScheduleType::Weekly, ScheduleConfig::weekly(3, "12:00"))
        );
        assert_eq!(
            add_schedule(&["add", "--name", "a", "--weekly", "1"]),
            (ScheduleType::Weekly, ScheduleConfig::weekly(1, "00:00"))
        );
    }

    #[test]
    fn test_add_requires_exactly_one_schedule() {
        let base = ["chime", "add", "--name", "a"];
        assert!(Cli::try_parse_from(base).is_err());

        let both = ["chime", "add", "--name", "a", "--hourly", "5", "--weekly", "2"];
        assert!(Cli::try_parse_from(both).is_err());
    }

    #[test]
    fn test_zone_flag() {
        let cli = parse(&["--zone", "utc", "list"]);
        assert_eq!(cli.zone, Zone::Utc);
        assert!(Cli::try_parse_from(["chime", "--zone", "mars", "list"]).is_err());
    }
}
