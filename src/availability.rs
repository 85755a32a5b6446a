//! Probe availability tracking for servercheck.
//!
//! Checks once at start-up that the external commands the collectors
//! shell out to are installed, so a missing package shows up as a clear
//! warning instead of only as degraded data.

use std::process::Command;

use crate::collectors::{DF_COMMAND, SENSORS_COMMAND};

/// Tracks which external probes are available.
#[derive(Default, Clone, Debug)]
pub struct ProbeAvailability {
    /// `sensors` is available (lm-sensors)
    pub sensors: bool,
    /// `df` is available (coreutils)
    pub df: bool,
}

impl ProbeAvailability {
    /// Probe all external commands and return availability status.
    pub fn probe() -> Self {
        Self {
            sensors: Self::check_command_available(SENSORS_COMMAND),
            df: Self::check_command_available(DF_COMMAND),
        }
    }

    /// Check if a command is available in PATH.
    fn check_command_available(cmd: &str) -> bool {
        Command::new("which")
            .arg(cmd)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Generate warnings for unavailable probes.
    pub fn get_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.sensors {
            warnings.push(
                "sensors not found (install lm-sensors for temperatures, check skipped)".into(),
            );
        }
        if !self.df {
            warnings.push("df not found (disk usage will be recorded as absent)".into());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::ProbeAvailability;

    #[test]
    fn warns_for_each_missing_probe() {
        let none = ProbeAvailability::default();
        assert_eq!(none.get_warnings().len(), 2);

        let all = ProbeAvailability {
            sensors: true,
            df: true,
        };
        assert!(all.get_warnings().is_empty());
    }
}
