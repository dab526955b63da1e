use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Strata scheduled report worker")]
pub struct Cli {
    /// Path to the config file (falls back to $STRATA_CONFIG, then ~/.strata/strata.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the schedule worker until SIGINT/SIGTERM
    Run,

    /// Print the upcoming occurrences of a schedule definition
    Preview {
        /// Definition JSON, e.g. '{"kind":"daily","times":["08:00"]}'
        #[arg(long)]
        definition: String,

        #[arg(long, default_value = "5")]
        count: usize,

        /// IANA timezone (defaults to worker.timezone, then $TZ, then UTC)
        #[arg(long)]
        timezone: Option<String>,

        /// Reference instant in RFC 3339 (defaults to now)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
    },

    /// Manage reports
    #[command(subcommand)]
    Report(ReportCommand),

    /// Manage schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Subcommand)]
pub enum ReportCommand {
    /// Register a report
    Add {
        #[arg(long)]
        name: String,

        /// SQL run against data.path; `:name` placeholders bind schedule parameters
        #[arg(long)]
        sql: String,
    },

    /// Delete a report and every schedule it owns
    Delete {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Create a schedule for a report
    Add {
        #[arg(long)]
        report_id: String,

        #[arg(long)]
        name: String,

        /// Definition JSON
        #[arg(long)]
        definition: String,

        /// Comma-separated email addresses
        #[arg(long, value_delimiter = ',')]
        recipients: Vec<String>,

        #[arg(long, default_value = "100")]
        max_inline_rows: u32,

        #[arg(long)]
        timezone: Option<String>,

        /// Report parameter as key=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// List all schedules
    List,

    Enable {
        #[arg(long)]
        id: String,
    },

    Disable {
        #[arg(long)]
        id: String,
    },

    /// Show recent runs of a schedule
    Runs {
        #[arg(long)]
        id: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}
