//! Threshold definitions for servercheck.
//!
//! A metric is *near threshold* when its configured maximum minus its
//! current value is at most [`NEAR_THRESHOLD_MARGIN`]. Values already over
//! the maximum give a negative margin and are flagged too.

use crate::config::Parameters;
use crate::metrics::Sample;

/// Points below a maximum at which a metric is flagged.
pub const NEAR_THRESHOLD_MARGIN: f64 = 2.0;

/// Whether `value` is within the margin of `limit` (or past it).
pub fn is_near_threshold(limit: i64, value: f64) -> bool {
    limit as f64 - value <= NEAR_THRESHOLD_MARGIN
}

/// Configured maxima for all monitored metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Package temperature maximum (C)
    pub max_temp: i64,
    /// CPU usage maximum (%)
    pub max_cpu: i64,
    /// Memory usage maximum (%)
    pub max_mem: i64,
    /// Per-partition usage maximum (%)
    pub max_disk: i64,
}

impl From<&Parameters> for Limits {
    fn from(parameters: &Parameters) -> Self {
        Self {
            max_temp: parameters.max_temp,
            max_cpu: parameters.max_cpu,
            max_mem: parameters.max_mem,
            max_disk: parameters.max_disk,
        }
    }
}

/// Metrics flagged in one evaluation, in check order. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThresholdReport {
    pub near_threshold: Vec<String>,
}

impl ThresholdReport {
    pub fn any(&self) -> bool {
        !self.near_threshold.is_empty()
    }

    /// HTML warning paragraph listing every flagged metric.
    pub fn warning_message(&self) -> String {
        format!(
            "Warning: The following metrics are within {} points of their thresholds: <br>{} <br>",
            NEAR_THRESHOLD_MARGIN,
            self.near_threshold.join(", ")
        )
    }
}

impl Limits {
    /// Compare `sample` against the limits.
    ///
    /// Temperature uses the hottest package and is skipped when no package
    /// reported. Partitions are checked one by one; absent readings are
    /// skipped.
    pub fn evaluate(&self, sample: &Sample) -> ThresholdReport {
        let mut near_threshold = Vec::new();

        if let Some(temp) = sample.max_temperature() {
            if is_near_threshold(self.max_temp, temp as f64) {
                near_threshold.push("Temperature".to_string());
            }
        }

        if is_near_threshold(self.max_cpu, sample.cpuinfo) {
            near_threshold.push("CPU usage".to_string());
        }

        if is_near_threshold(self.max_mem, sample.meminfo) {
            near_threshold.push("Memory usage".to_string());
        }

        for (partition, usage) in &sample.diskinfo {
            if let Some(usage) = usage {
                if is_near_threshold(self.max_disk, *usage as f64) {
                    near_threshold.push(format!("Disk usage ({partition})"));
                }
            }
        }

        ThresholdReport { near_threshold }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{is_near_threshold, Limits};
    use crate::metrics::Sample;

    const LIMITS: Limits = Limits {
        max_temp: 65,
        max_cpu: 99,
        max_mem: 95,
        max_disk: 90,
    };

    fn calm_sample() -> Sample {
        Sample {
            datetime: NaiveDate::from_ymd_opt(2024, 5, 1)
                .and_then(|d| d.and_hms_opt(8, 0, 0))
                .expect("valid date"),
            tempinfo: [("0".to_string(), 40), ("1".to_string(), 42)].into(),
            cpuinfo: 10.0,
            meminfo: 30.0,
            diskinfo: [("/".to_string(), Some(50)), ("/home".to_string(), Some(20))].into(),
        }
    }

    #[test]
    fn margin_is_inclusive_and_sign_independent() {
        assert!(is_near_threshold(90, 88.0));
        assert!(!is_near_threshold(90, 87.9));
        assert!(is_near_threshold(90, 90.0));
        assert!(is_near_threshold(90, 120.0));
        assert!(is_near_threshold(0, 50.0));
    }

    #[test]
    fn calm_host_flags_nothing() {
        let report = LIMITS.evaluate(&calm_sample());
        assert!(!report.any());
    }

    #[test]
    fn busy_cpu_is_flagged_alone() {
        let mut sample = calm_sample();
        sample.cpuinfo = 97.0;
        let report = LIMITS.evaluate(&sample);
        assert_eq!(report.near_threshold, vec!["CPU usage"]);
        assert!(report.warning_message().contains("CPU usage"));
    }

    #[test]
    fn temperature_uses_hottest_package() {
        let mut sample = calm_sample();
        sample.tempinfo.insert("1".to_string(), 64);
        let report = LIMITS.evaluate(&sample);
        assert_eq!(report.near_threshold, vec!["Temperature"]);
    }

    #[test]
    fn empty_temperatures_skip_the_check() {
        let mut sample = calm_sample();
        sample.tempinfo.clear();
        let limits = Limits {
            max_temp: 0,
            ..LIMITS
        };
        assert!(!limits.evaluate(&sample).any());
    }

    #[test]
    fn each_partition_gets_its_own_label() {
        let mut sample = calm_sample();
        sample.diskinfo.insert("/".to_string(), Some(89));
        sample.diskinfo.insert("/home".to_string(), Some(95));
        sample.diskinfo.insert("/srv".to_string(), None);
        let report = LIMITS.evaluate(&sample);
        assert_eq!(
            report.near_threshold,
            vec!["Disk usage (/)", "Disk usage (/home)"]
        );
    }
}
