use std::{fs, path::Path};

use anyhow::{Context, Result};
use backlink_risk::cli::{commands, flags::Cli};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ROTATE_BYTES: u64 = 1_000_000;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, &cli.log_file)?;
    commands::run(cli).await
}

fn init_tracing(verbose: u8, log_file: &str) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_path = Path::new(log_file);
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log dir {}", parent.display()))?;
    }
    if let Ok(meta) = fs::metadata(log_path) {
        if meta.len() > LOG_ROTATE_BYTES {
            let _ = fs::rename(log_path, log_path.with_extension("log.1"));
        }
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    let file_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(false);
    // stdout carries the JSON output, so console logs go to stderr
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("installing tracing subscriber")
}
