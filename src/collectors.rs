//! Metric collectors for servercheck.
//!
//! Four independent, blocking probes:
//!
//! - `sensors` (lm-sensors) - CPU package temperatures
//! - `sysinfo` - CPU usage over a 5 second window
//! - `sysinfo` - used memory percentage
//! - `df` - usage of each requested partition
//!
//! A failing external command never aborts a run. The failure is logged,
//! returned in [`Collection::failures`] and the metric degrades to empty
//! (temperatures) or null (partitions).

use std::process::{Command, ExitStatus};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Local;
use regex::Regex;
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{DiskInfo, Sample, TempInfo};

/// Sensor reporting command.
pub const SENSORS_COMMAND: &str = "sensors";

/// Disk-free command.
pub const DF_COMMAND: &str = "df";

/// CPU usage is averaged over this window. Instantaneous readings are
/// unreliable, and this wait dominates the run time.
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(5);

/// A probe that could not produce data.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        source: std::io::Error,
    },
    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: &'static str,
        status: ExitStatus,
        stderr: String,
    },
}

/// External commands and timing used for one collection pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probes {
    /// Temperature command
    pub sensors: &'static str,
    /// Disk usage command
    pub df: &'static str,
    /// CPU usage averaging window
    pub cpu_window: Duration,
}

impl Default for Probes {
    fn default() -> Self {
        Self {
            sensors: SENSORS_COMMAND,
            df: DF_COMMAND,
            cpu_window: CPU_SAMPLE_WINDOW,
        }
    }
}

/// Result of one collection pass.
#[derive(Debug)]
pub struct Collection {
    /// The sample, complete or degraded
    pub sample: Sample,
    /// Probes that failed while building it
    pub failures: Vec<CollectorError>,
}

impl Collection {
    /// Whether any probe failed.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Run every probe and assemble a [`Sample`] stamped with the local time.
pub fn collect_sample(probes: &Probes, partitions: &[String]) -> Collection {
    let datetime = Local::now().naive_local();
    let mut failures = Vec::new();

    let tempinfo = read_temperatures(probes.sensors).unwrap_or_else(|err| {
        warn!(error = %err, "temperature probe failed, continuing without readings");
        failures.push(err);
        TempInfo::new()
    });

    let mut sys = System::new();
    let cpuinfo = read_cpu_usage(&mut sys, probes.cpu_window);
    let meminfo = read_memory_usage(&mut sys);

    let diskinfo = read_disk_usage(probes.df, partitions).unwrap_or_else(|err| {
        warn!(error = %err, "disk probe failed, partitions recorded as absent");
        failures.push(err);
        partitions.iter().map(|p| (p.clone(), None)).collect()
    });

    Collection {
        sample: Sample {
            datetime,
            tempinfo,
            cpuinfo,
            meminfo,
            diskinfo,
        },
        failures,
    }
}

/// Run `command` with `args` and return its stdout.
fn run_command(command: &'static str, args: &[&str]) -> Result<String, CollectorError> {
    let output = Command::new(command)
        .args(args)
        .output()
        .map_err(|source| CollectorError::Spawn { command, source })?;

    if !output.status.success() {
        return Err(CollectorError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Read CPU package temperatures from a `sensors`-style command.
pub fn read_temperatures(command: &'static str) -> Result<TempInfo, CollectorError> {
    let output = run_command(command, &[])?;
    let temps = parse_sensors_output(&output);
    debug!(packages = temps.len(), "read package temperatures");
    Ok(temps)
}

/// Extract `Package id N: +T.0°C` lines into a package id to °C map.
pub fn parse_sensors_output(output: &str) -> TempInfo {
    static PACKAGE_RE: OnceLock<Regex> = OnceLock::new();
    let re = PACKAGE_RE.get_or_init(|| {
        Regex::new(r"Package id (\d+):\s+\+(\d+)\.0°C").expect("package regex is valid")
    });

    re.captures_iter(output)
        .filter_map(|caps| {
            let temp = caps[2].parse::<i64>().ok()?;
            Some((caps[1].to_string(), temp))
        })
        .collect()
}

/// Average CPU usage across all cores, sampled over `window`.
///
/// Blocks for the whole window.
pub fn read_cpu_usage(sys: &mut System, window: Duration) -> f64 {
    sys.refresh_cpu_usage();
    std::thread::sleep(window);
    sys.refresh_cpu_usage();
    f64::from(sys.global_cpu_usage())
}

/// Used memory as a percentage of total (total minus available).
pub fn read_memory_usage(sys: &mut System) -> f64 {
    sys.refresh_memory();
    memory_percent(sys.total_memory(), sys.available_memory())
}

pub(crate) fn memory_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(available) as f64 / total as f64 * 100.0
}

/// Read usage of the requested partitions from a `df`-style command.
pub fn read_disk_usage(
    command: &'static str,
    partitions: &[String],
) -> Result<DiskInfo, CollectorError> {
    let output = run_command(command, &[])?;
    Ok(parse_df_output(&output, partitions))
}

/// Map each requested partition to its usage in `df` output.
///
/// A line belongs to a partition when it ends with the mount point preceded
/// by whitespace, so `/home` never matches `/mnt/home` and mount points may
/// contain spaces. Every requested partition is present in the result, in
/// the requested order; those not found (or without a percentage) map to
/// `None`.
pub fn parse_df_output(output: &str, partitions: &[String]) -> DiskInfo {
    static PERCENT_RE: OnceLock<Regex> = OnceLock::new();
    let re = PERCENT_RE.get_or_init(|| Regex::new(r"(\d+)%").expect("percent regex is valid"));

    let mut usage: DiskInfo = partitions.iter().map(|p| (p.clone(), None)).collect();

    for line in output.lines().map(str::trim_end) {
        for (partition, slot) in usage.iter_mut() {
            let mounted_here = line
                .strip_suffix(partition.as_str())
                .is_some_and(|rest| rest.ends_with(char::is_whitespace));
            if mounted_here {
                *slot = re
                    .captures(line)
                    .and_then(|caps| caps[1].parse::<i64>().ok());
            }
        }
    }

    for (partition, value) in &usage {
        if value.is_none() {
            debug!(partition = %partition, "partition not found in df output");
        }
    }

    usage
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        collect_sample, memory_percent, parse_df_output, parse_sensors_output, read_disk_usage,
        CollectorError, Probes,
    };

    const SENSORS_OUTPUT: &str = "\
coretemp-isa-0000
Adapter: ISA adapter
Package id 0:  +45.0°C  (high = +80.0°C, crit = +100.0°C)
Core 0:        +43.0°C  (high = +80.0°C, crit = +100.0°C)
Core 1:        +44.0°C  (high = +80.0°C, crit = +100.0°C)

coretemp-isa-0001
Adapter: ISA adapter
Package id 1:  +52.0°C  (high = +80.0°C, crit = +100.0°C)
";

    const DF_OUTPUT: &str = "\
Filesystem     1K-blocks      Used Available Use% Mounted on
udev             8112344         0   8112344   0% /dev
/dev/nvme0n1p2 479151816 331244000 123500000  73% /
/dev/nvme0n1p1    523248      6220    517028   2% /boot/efi
/dev/sda1      960302804 412345678 499123456  46% /home
/dev/sdb1      960302804 812345678  99123456  90% /mnt/home
/dev/sdc1      976762584 781410067 195352517  80% /media/My Disk
";

    fn parts(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn parses_every_package() {
        let temps = parse_sensors_output(SENSORS_OUTPUT);
        assert_eq!(temps.len(), 2);
        assert_eq!(temps.get("0"), Some(&45));
        assert_eq!(temps.get("1"), Some(&52));
    }

    #[test]
    fn no_packages_yields_empty_map() {
        let temps = parse_sensors_output("acpitz-acpi-0\ntemp1:        +27.8°C\n");
        assert!(temps.is_empty());
    }

    #[test]
    fn matches_exact_mount_point() {
        let usage = parse_df_output(DF_OUTPUT, &parts(&["/", "/home"]));
        assert_eq!(usage.len(), 2);
        assert_eq!(usage.get("/"), Some(&Some(73)));
        assert_eq!(usage.get("/home"), Some(&Some(46)));
    }

    #[test]
    fn matches_mount_point_with_spaces() {
        let usage = parse_df_output(DF_OUTPUT, &parts(&["/media/My Disk", "/home"]));
        assert_eq!(usage.get("/media/My Disk"), Some(&Some(80)));
        assert_eq!(usage.get("/home"), Some(&Some(46)));
    }

    #[test]
    fn keeps_requested_order() {
        let usage = parse_df_output(DF_OUTPUT, &parts(&["/home", "/", "/boot/efi"]));
        let order: Vec<&str> = usage.keys().map(String::as_str).collect();
        assert_eq!(order, ["/home", "/", "/boot/efi"]);
    }

    #[test]
    fn missing_partition_is_present_as_none() {
        let usage = parse_df_output(DF_OUTPUT, &parts(&["/", "/srv"]));
        assert_eq!(usage.get("/"), Some(&Some(73)));
        assert_eq!(usage.get("/srv"), Some(&None));
    }

    #[test]
    fn empty_output_keeps_all_keys() {
        let usage = parse_df_output("", &parts(&["/", "/home"]));
        assert_eq!(usage.len(), 2);
        assert!(usage.values().all(Option::is_none));
    }

    #[test]
    fn memory_percent_handles_zero_total() {
        assert_eq!(memory_percent(0, 0), 0.0);
        assert!((memory_percent(1000, 250) - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_commands_degrade_the_sample() {
        let probes = Probes {
            sensors: "servercheck-no-such-sensors",
            df: "servercheck-no-such-df",
            cpu_window: Duration::ZERO,
        };
        let partitions = parts(&["/", "/home"]);

        let collection = collect_sample(&probes, &partitions);

        assert!(collection.is_degraded());
        assert_eq!(collection.failures.len(), 2);
        assert!(collection
            .failures
            .iter()
            .all(|err| matches!(err, CollectorError::Spawn { .. })));
        assert!(collection.sample.tempinfo.is_empty());
        let keys: Vec<&str> = collection
            .sample
            .diskinfo
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, ["/", "/home"]);
        assert!(collection.sample.diskinfo.values().all(Option::is_none));
    }

    #[test]
    fn failing_command_reports_exit_status() {
        let err = read_disk_usage("false", &parts(&["/"])).expect_err("false exits non-zero");
        assert!(matches!(err, CollectorError::Failed { command: "false", .. }));
    }

    #[test]
    fn default_probes_use_system_commands() {
        let probes = Probes::default();
        assert_eq!(probes.sensors, "sensors");
        assert_eq!(probes.df, "df");
        assert_eq!(probes.cpu_window, Duration::from_secs(5));
    }
}
