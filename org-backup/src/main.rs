//! org-backup - Main entry point
//!
//! Runs one backup of a GitHub organization and exits with a code that
//! reflects the run signal (0 success, 1 warnings, 2 failed, 3 fatal).

use anyhow::Result;
use clap::Parser;
use org_backup::budget::TimeBudget;
use org_backup::daemon::shutdown::ShutdownCoordinator;
use org_backup::{config::Config, credentials, orchestrator, utils, RunReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Organization to back up (overrides config)
    #[arg(long)]
    org: Option<String>,

    /// Destination bucket (overrides config)
    #[arg(long)]
    bucket: Option<String>,

    /// Working directory for mirrors and staging (overrides config)
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Hard time ceiling of the run in seconds (overrides config)
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Also write the run report to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(ref org) = self.org {
            config.github.organization = org.clone();
        }
        if let Some(ref bucket) = self.bucket {
            config.storage.bucket = bucket.clone();
        }
        if let Some(ref dir) = self.work_dir {
            config.run.work_dir = dir.clone();
        }
        if let Some(secs) = self.deadline_secs {
            config.run.time_ceiling_secs = secs;
        }
        if let Some(ref level) = self.log_level {
            config.log.level = level.clone();
        }
        if let Some(ref path) = self.report {
            config.run.report_path = Some(path.clone());
        }
    }
}

fn load_config(args: &Args) -> org_backup::Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env();
    args.apply(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let config = load_config(&args);
    let (log_level, log_format) = match config {
        Ok(ref c) => (c.log.level.clone(), c.log.format.clone()),
        Err(_) => (args.log_level.clone().unwrap_or_else(|| "info".into()), "text".into()),
    };
    utils::logger::init(&log_level, &log_format)?;

    tracing::info!("Starting org-backup v{}", env!("CARGO_PKG_VERSION"));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            let report = RunReport::fatal(
                &uuid::Uuid::new_v4().to_string(),
                args.org.as_deref().unwrap_or_default(),
                chrono::Utc::now(),
                e.to_string(),
            );
            println!("{}", report.to_json()?);
            std::process::exit(report.signal.exit_code());
        }
    };

    let time = Arc::new(TimeBudget::new(
        Duration::from_secs(config.run.time_ceiling_secs),
        Duration::from_secs(config.run.safety_margin_secs),
    ));
    let shutdown = ShutdownCoordinator::new(time.cancellation_token()).spawn();

    let report = match credentials::provider_from_config(&config.credentials) {
        Ok(provider) => orchestrator::run_from_config(&config, provider.as_ref(), time.clone()).await,
        Err(e) => {
            tracing::error!("Cannot set up credential lookup: {}", e);
            RunReport::fatal(
                &uuid::Uuid::new_v4().to_string(),
                &config.github.organization,
                chrono::Utc::now(),
                e.to_string(),
            )
        }
    };

    // the run is over; stop listening for signals
    time.cancel();
    let _ = shutdown.await;

    println!("{}", report.to_json()?);
    if let Some(ref path) = config.run.report_path {
        match report.write_to(path) {
            Ok(()) => tracing::info!("Run report written to {}", path.display()),
            Err(e) => tracing::error!("Failed to write run report to {}: {}", path.display(), e),
        }
    }

    std::process::exit(report.signal.exit_code());
}
