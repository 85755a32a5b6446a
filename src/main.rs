//! # servercheck
//!
//! A lightweight watchdog for a single Linux server.
//!
//! ## Overview
//!
//! `servercheck` is meant to be run from a scheduler. Each invocation
//! samples the host once, appends the sample to a history file and emails
//! the operator when something needs attention:
//!
//! - CPU package temperatures (from `sensors`)
//! - CPU usage over a 5 second window
//! - Memory usage
//! - Usage of selected partitions (from `df`)
//!
//! Every email carries the current values next to their limits and three
//! trend charts drawn from the recent history.
//!
//! ## Usage
//!
//! ```bash
//! # Email only if a metric is within 2 points of its limit (default)
//! servercheck
//!
//! # Always email a status report
//! servercheck --notify
//!
//! # Tell the operator the server is going down
//! servercheck --alarm
//! ```
//!
//! ## Module Organization
//!
//! - [`config`]: CLI flags and INI configuration
//! - [`metrics`]: The sample record and its encoding
//! - [`collectors`]: Probes for temperature, CPU, memory and disks
//! - [`availability`]: Start-up check for the external probe commands
//! - [`history`]: Append-only sample log and the in-memory window
//! - [`thresholds`]: Near-threshold evaluation
//! - [`charts`]: Trend chart rendering
//! - [`notifier`]: Email composition and delivery
//! - [`app`]: Run context and pipeline

mod app;
mod availability;
mod charts;
mod collectors;
mod config;
mod history;
mod metrics;
mod notifier;
mod thresholds;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use app::RunContext;
use config::{Cli, Settings};
use notifier::SmtpMailer;

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    #[cfg(not(target_os = "linux"))]
    {
        eprintln!("Warning: servercheck relies on `sensors` and `df` output from Linux;");
        eprintln!("temperature and disk readings may be missing on this platform.");
    }

    init_logging();
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config_path()) {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "cannot start without a valid configuration");
            return ExitCode::FAILURE;
        }
    };

    let ctx = RunContext::new(settings, &cli);
    let mailer = SmtpMailer::new(ctx.settings.email.clone());

    match app::run(&ctx, &mailer) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "run aborted");
            ExitCode::FAILURE
        }
    }
}
