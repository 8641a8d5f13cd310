use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "backlink-risk",
    version,
    about = "Backlink risk assessment: batched classification with enrichment reconciliation"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config file (TOML). Default: config/backlink-risk.toml
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Increase verbosity (info, debug, trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log file path
    #[arg(long, global = true, default_value = "data/backlink-risk.log")]
    pub log_file: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a pending task and load its discovered links (JSONL)
    Submit {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        task_id: String,
        /// One discovered link per line
        #[arg(long)]
        links: PathBuf,
    },
    /// Process eligible tasks and expire stuck ones
    Sweep {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        max_age_hours: Option<i64>,
        /// Include tasks older than the max age
        #[arg(long)]
        force: bool,
    },
    /// Process a single task
    Process {
        #[arg(long)]
        task_id: String,
        /// Re-run a task that already finished
        #[arg(long)]
        force: bool,
    },
    /// Print the task report
    Status {
        #[arg(long)]
        task_id: String,
    },
    /// Print high and critical risk backlinks of a domain
    Harmful {
        #[arg(long)]
        domain: String,
    },
}
