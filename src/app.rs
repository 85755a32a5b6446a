//! Run orchestration for servercheck.
//!
//! This module contains the [`RunContext`], the immutable description of
//! one invocation, and the pipeline that threads it through every stage:
//! collect, persist, then evaluate and/or notify depending on the mode.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::availability::ProbeAvailability;
use crate::charts::ChartRenderer;
use crate::collectors::{self, Probes};
use crate::config::{Cli, Mode, Settings};
use crate::history::{HistoryError, HistoryStore, HistoryWindow, HISTORY_FILE};
use crate::metrics::Sample;
use crate::notifier::{Delivery, Mailer, Notifier};
use crate::thresholds::Limits;

/// Everything a run needs to know, fixed before the first probe runs.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Settings with the effective (possibly overridden) temperature limit
    pub settings: Settings,
    /// Selected run mode
    pub mode: Mode,
    /// Prepended to every outgoing message; empty without an override
    pub override_note: String,
    /// Directory for the history file and charts
    pub workdir: PathBuf,
}

impl RunContext {
    /// Apply the CLI's mode and temperature override to loaded settings.
    ///
    /// The override only affects this run; the configuration file is left
    /// alone.
    pub fn new(mut settings: Settings, cli: &Cli) -> Self {
        let mut override_note = String::new();
        if let Some(max_temp) = cli.max_temp_override {
            let configured = settings.parameters.max_temp;
            if max_temp != configured {
                override_note = format!(
                    "Config.ini temperature of {configured} was overridden to {max_temp}"
                );
                settings.parameters.max_temp = max_temp;
            }
        }

        Self {
            settings,
            mode: cli.mode(),
            override_note,
            workdir: cli.workdir.clone(),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits::from(&self.settings.parameters)
    }

    pub fn server(&self) -> &str {
        &self.settings.parameters.server
    }

    pub fn history_store(&self) -> HistoryStore {
        HistoryStore::new(
            self.workdir.join(HISTORY_FILE),
            self.settings.parameters.datapoints,
        )
    }

    pub fn chart_dir(&self) -> &Path {
        &self.workdir
    }
}

/// What a run did.
#[derive(Debug)]
pub struct RunReport {
    pub mode: Mode,
    /// Whether a warning fired; `None` when evaluation was skipped (alarm)
    pub warned: Option<bool>,
    /// One entry per attempted email
    pub deliveries: Vec<Delivery>,
}

impl RunReport {
    pub fn sent(&self) -> usize {
        self.deliveries.iter().filter(|d| d.is_sent()).count()
    }
}

/// Evaluate thresholds and send the warning email if anything is near its
/// limit. Returns whether a warning fired.
pub fn check_status(
    ctx: &RunContext,
    notifier: &Notifier<'_>,
    window: &HistoryWindow,
    sample: &Sample,
    deliveries: &mut Vec<Delivery>,
) -> bool {
    let report = ctx.limits().evaluate(sample);
    if !report.any() {
        return false;
    }

    warn!(metrics = ?report.near_threshold, "metrics near threshold");
    let subject = format!("Warning: Status near threshold on {}", ctx.server());
    deliveries.push(notifier.send(&subject, &report.warning_message(), window, sample));
    true
}

/// Mode branch of the pipeline, after the sample has been persisted.
pub fn dispatch(
    ctx: &RunContext,
    notifier: &Notifier<'_>,
    window: &HistoryWindow,
    sample: &Sample,
) -> RunReport {
    let mut deliveries = Vec::new();

    let warned = match ctx.mode {
        Mode::Alarm => {
            let subject = format!("### ALARM ### on {}", ctx.server());
            let message = format!("Server {} is going down NOW!", ctx.server());
            deliveries.push(notifier.send(&subject, &message, window, sample));
            None
        }
        Mode::Notify => {
            let warned = check_status(ctx, notifier, window, sample, &mut deliveries);
            if !warned {
                let subject = format!("Status report on {}", ctx.server());
                deliveries.push(notifier.send(&subject, "All is fine!<br>", window, sample));
            }
            Some(warned)
        }
        Mode::Check => Some(check_status(ctx, notifier, window, sample, &mut deliveries)),
    };

    RunReport {
        mode: ctx.mode,
        warned,
        deliveries,
    }
}

/// One full pass: collect, persist, then dispatch on the mode.
///
/// Only history file errors fail the run. Probe and delivery failures are
/// logged and degrade the result.
pub fn run(ctx: &RunContext, mailer: &dyn Mailer) -> Result<RunReport, HistoryError> {
    for warning in ProbeAvailability::probe().get_warnings() {
        warn!("{warning}");
    }

    let collection =
        collectors::collect_sample(&Probes::default(), &ctx.settings.parameters.partitions);
    if collection.is_degraded() {
        warn!(
            failures = collection.failures.len(),
            "sample collected with missing data"
        );
    }
    let sample = collection.sample;

    let store = ctx.history_store();
    let mut window = store.load()?;
    store.append(&sample)?;
    window.push(sample.clone());
    debug!(path = %store.path().display(), window = window.len(), "sample recorded");

    let renderer = ChartRenderer::new(ctx.chart_dir());
    let notifier = Notifier::new(
        mailer,
        Some(&renderer),
        ctx.chart_dir(),
        &ctx.override_note,
        ctx.limits(),
    );
    let report = dispatch(ctx, &notifier, &window, &sample);

    info!(
        mode = ?report.mode,
        temperature = ?sample.max_temperature(),
        cpu = sample.cpuinfo,
        memory = sample.meminfo,
        disks = ?sample.diskinfo,
        warned = ?report.warned,
        emails = report.sent(),
        "run complete"
    );
    Ok(report)
}
