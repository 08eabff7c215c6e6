use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sweep")]
#[command(about = "Distributed TCP port-scanning pipeline")]
pub struct Cli {
    /// Log to stderr instead of the log file
    #[arg(short, long)]
    pub verbose: bool,

    /// JSON state file shared across invocations
    #[arg(long)]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the pipeline: cadence tickers, scan workers, result processor
    Run {
        /// Number of scan workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Run one scheduler pass for a cadence
    Tick {
        /// hourly, 12hour, daily, weekly or monthly
        cadence: String,

        /// Cap on due schedules handled in this pass
        #[arg(long)]
        max_ips: Option<usize>,
    },

    /// Scan one IP right away and print the consolidated result
    Scan {
        ip: String,

        /// previous_open, top_100, custom_3500 or full_65k
        #[arg(long, default_value = "top_100")]
        port_set: String,

        /// Explicit comma-separated ports (overrides --port-set)
        #[arg(long)]
        ports: Option<String>,
    },

    /// Show consolidated scan results for an IP
    Results {
        ip: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Register a target IP
    AddIp { ip: String },

    /// Delete a target IP and everything recorded for it
    DelIp { ip: String },

    /// Add a scan schedule for an IP
    AddSchedule {
        ip: String,

        /// hourly, 12hour, daily, weekly or monthly
        cadence: String,

        /// previous_open, top_100, custom_3500 or full_65k
        #[arg(long, default_value = "previous_open")]
        port_set: String,

        /// Create the schedule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List schedules for an IP
    Schedules { ip: String },
}

pub fn parse() -> Cli {
    Cli::parse()
}
