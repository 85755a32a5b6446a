//! Command-line flags and configuration file loading for servercheck.
//!
//! The CLI is parsed with `clap` and only selects *what* a run does (the
//! mode and an optional temperature override). Everything describing the
//! monitored host lives in an INI file read with the `config` crate:
//!
//! ```ini
//! [parameters]
//! server = backup-box
//! maxtemp = 65
//! maxcpu = 99
//! maxmem = 95
//! maxdisk = 90
//! partitions = /, /home
//! datapoints = 288
//!
//! [email]
//! sender = watchdog@example.com
//! receiver = admin@example.com
//! app_password = secret
//! mailserver = smtp.example.com:587
//! ```
//!
//! Every key is required. There is no defaulting beyond what the file says.

use std::path::{Path, PathBuf};

use clap::{Args, Parser};
use config::{File, FileFormat};
use thiserror::Error;

/// Monitor a server and send emails based on its status.
///
/// Meant to be run periodically from a scheduler. Each invocation samples
/// the host once, appends the sample to the history file and, depending on
/// the mode, emails a warning, a status report or an alarm.
///
/// # Examples
///
/// ```bash
/// # Check thresholds, email only on warnings (default)
/// servercheck
///
/// # Daily report, always emails
/// servercheck --notify
///
/// # From a shutdown hook
/// servercheck --alarm
///
/// # Temporarily allow a hotter CPU
/// servercheck -o 80
/// ```
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Monitor server and send emails based on its status")]
pub struct Cli {
    #[command(flatten)]
    pub mode: ModeArgs,

    /// Override the configured maxtemp for this run only.
    ///
    /// The configuration file is not modified. When the value differs from
    /// the configured one, every email sent during the run mentions it.
    #[arg(short = 'o', long = "override", value_name = "MAXTEMP")]
    pub max_temp_override: Option<i64>,

    /// Path to the INI configuration file.
    ///
    /// Relative paths are resolved against `--workdir`.
    #[arg(long, default_value = "config.ini")]
    pub config: PathBuf,

    /// Directory holding the configuration, history file and charts.
    ///
    /// Schedulers usually start jobs in the home directory; point this at
    /// the install directory instead of changing into it.
    #[arg(short, long, default_value = ".")]
    pub workdir: PathBuf,
}

/// The three mutually exclusive run modes.
#[derive(Args, Debug, Clone, Default)]
#[group(required = false, multiple = false)]
pub struct ModeArgs {
    /// Explicitly send alarm e-mail about server shutdown
    #[arg(short, long)]
    pub alarm: bool,

    /// Notify current server status by e-mail
    #[arg(short, long)]
    pub notify: bool,

    /// Check server status and only send an e-mail if any warnings arise (default mode)
    #[arg(short, long)]
    pub check: bool,
}

/// What a run does after sampling the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    /// Send the alarm email, skip threshold evaluation.
    Alarm,
    /// Evaluate thresholds, send a status email when nothing fired.
    Notify,
    /// Evaluate thresholds, email only on warnings.
    #[default]
    Check,
}

impl Cli {
    /// Resolve the selected mode. `check` is the implicit default.
    pub fn mode(&self) -> Mode {
        match (self.mode.alarm, self.mode.notify, self.mode.check) {
            (true, _, _) => Mode::Alarm,
            (_, true, _) => Mode::Notify,
            (_, _, true) | (false, false, false) => Mode::Check,
        }
    }

    /// Configuration file path, resolved against the working directory.
    pub fn config_path(&self) -> PathBuf {
        resolve(&self.workdir, &self.config)
    }
}

/// Join `path` onto `base` unless it is already absolute.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Errors raised while loading the configuration file. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file {path}: {source}")]
    Load {
        path: String,
        source: config::ConfigError,
    },
    #[error("missing config key {key}")]
    Missing { key: String },
    #[error("invalid value for config key {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// `[parameters]` section: what to watch and the limits to watch for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameters {
    /// Server name used in email subjects
    pub server: String,
    /// Maximum CPU package temperature (°C)
    pub max_temp: i64,
    /// Maximum CPU usage (%)
    pub max_cpu: i64,
    /// Maximum memory usage (%)
    pub max_mem: i64,
    /// Maximum usage of any monitored partition (%)
    pub max_disk: i64,
    /// Mount points to monitor, in configured order
    pub partitions: Vec<String>,
    /// Number of past samples kept for evaluation and charts
    pub datapoints: usize,
}

/// `[email]` section.
///
/// The submission password is stored in clear text in the INI file.
#[derive(Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub sender: String,
    pub receiver: String,
    pub app_password: String,
    /// `host` or `host:port`
    pub mailserver: String,
}

impl std::fmt::Debug for MailSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailSettings")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("app_password", &"<redacted>")
            .field("mailserver", &self.mailserver)
            .finish()
    }
}

impl MailSettings {
    /// Default mail submission port.
    pub const SUBMISSION_PORT: u16 = 587;

    /// Split `mailserver` into host and port.
    pub fn server_address(&self) -> Result<(String, u16), ConfigError> {
        let raw = self.mailserver.trim();
        match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|err| ConfigError::Invalid {
                    key: "email.mailserver".to_string(),
                    reason: format!("bad port {port:?}: {err}"),
                })?;
                Ok((host.to_string(), port))
            }
            None => Ok((raw.to_string(), Self::SUBMISSION_PORT)),
        }
    }
}

/// Fully parsed configuration, immutable for the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub parameters: Parameters,
    pub email: MailSettings,
}

impl Settings {
    /// Load and validate the INI file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini).required(true))
            .build()
            .map_err(|source| ConfigError::Load {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_raw(&raw)
    }

    /// Parse settings from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()
            .map_err(|source| ConfigError::Load {
                path: "<inline>".to_string(),
                source,
            })?;
        Self::from_raw(&raw)
    }

    fn from_raw(raw: &config::Config) -> Result<Self, ConfigError> {
        let datapoints = get_int(raw, "parameters.datapoints")?;
        let datapoints = usize::try_from(datapoints).map_err(|_| ConfigError::Invalid {
            key: "parameters.datapoints".to_string(),
            reason: format!("must not be negative, got {datapoints}"),
        })?;

        let parameters = Parameters {
            server: get_string(raw, "parameters.server")?,
            max_temp: get_int(raw, "parameters.maxtemp")?,
            max_cpu: get_int(raw, "parameters.maxcpu")?,
            max_mem: get_int(raw, "parameters.maxmem")?,
            max_disk: get_int(raw, "parameters.maxdisk")?,
            partitions: split_partitions(&get_string(raw, "parameters.partitions")?),
            datapoints,
        };

        let email = MailSettings {
            sender: get_string(raw, "email.sender")?,
            receiver: get_string(raw, "email.receiver")?,
            app_password: get_string(raw, "email.app_password")?,
            mailserver: get_string(raw, "email.mailserver")?,
        };

        Ok(Self { parameters, email })
    }
}

/// Comma-separated list, entries trimmed, empty entries dropped.
fn split_partitions(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn get_string(raw: &config::Config, key: &str) -> Result<String, ConfigError> {
    raw.get_string(key).map_err(|err| key_error(key, err))
}

fn get_int(raw: &config::Config, key: &str) -> Result<i64, ConfigError> {
    raw.get_int(key).map_err(|err| key_error(key, err))
}

fn key_error(key: &str, err: config::ConfigError) -> ConfigError {
    match err {
        config::ConfigError::NotFound(_) => ConfigError::Missing {
            key: key.to_string(),
        },
        other => ConfigError::Invalid {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, ConfigError, Mode, Settings};

    const SAMPLE_INI: &str = "\
[parameters]
server = backup-box
maxtemp = 65
maxcpu = 99
maxmem = 95
maxdisk = 90
partitions = / ,  /home,
datapoints = 10

[email]
sender = watchdog@example.com
receiver = admin@example.com
app_password = secret
mailserver = smtp.example.com:2525
";

    #[test]
    fn parses_complete_file() {
        let settings = Settings::from_ini_str(SAMPLE_INI).expect("valid config");
        assert_eq!(settings.parameters.server, "backup-box");
        assert_eq!(settings.parameters.max_temp, 65);
        assert_eq!(settings.parameters.max_cpu, 99);
        assert_eq!(settings.parameters.max_mem, 95);
        assert_eq!(settings.parameters.max_disk, 90);
        assert_eq!(settings.parameters.partitions, vec!["/", "/home"]);
        assert_eq!(settings.parameters.datapoints, 10);
        assert_eq!(settings.email.receiver, "admin@example.com");
        assert_eq!(
            settings.email.server_address().expect("address"),
            ("smtp.example.com".to_string(), 2525)
        );
    }

    #[test]
    fn missing_key_is_an_error() {
        let text = SAMPLE_INI.replace("maxcpu = 99\n", "");
        let err = Settings::from_ini_str(&text).expect_err("maxcpu is required");
        assert!(matches!(err, ConfigError::Missing { ref key } if key == "parameters.maxcpu"));
    }

    #[test]
    fn non_integer_threshold_is_an_error() {
        let text = SAMPLE_INI.replace("maxtemp = 65", "maxtemp = hot");
        let err = Settings::from_ini_str(&text).expect_err("maxtemp must be an integer");
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "parameters.maxtemp"));
    }

    #[test]
    fn negative_datapoints_is_an_error() {
        let text = SAMPLE_INI.replace("datapoints = 10", "datapoints = -1");
        let err = Settings::from_ini_str(&text).expect_err("datapoints must be >= 0");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = Settings::load(dir.path().join("nope.ini")).expect_err("file is absent");
        assert!(matches!(err, ConfigError::Load { .. }));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.ini");
        std::fs::write(&path, SAMPLE_INI).expect("write config");
        let settings = Settings::load(&path).expect("valid config");
        assert_eq!(settings.parameters.server, "backup-box");
    }

    #[test]
    fn mailserver_without_port_uses_submission_port() {
        let text = SAMPLE_INI.replace("smtp.example.com:2525", "smtp.example.com");
        let settings = Settings::from_ini_str(&text).expect("valid config");
        assert_eq!(
            settings.email.server_address().expect("address"),
            ("smtp.example.com".to_string(), 587)
        );
    }

    #[test]
    fn debug_output_hides_password() {
        let settings = Settings::from_ini_str(SAMPLE_INI).expect("valid config");
        let rendered = format!("{:?}", settings.email);
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn mode_defaults_to_check() {
        let cli = Cli::parse_from(["servercheck"]);
        assert_eq!(cli.mode(), Mode::Check);
        assert_eq!(cli.max_temp_override, None);

        let cli = Cli::parse_from(["servercheck", "-n", "-o", "70"]);
        assert_eq!(cli.mode(), Mode::Notify);
        assert_eq!(cli.max_temp_override, Some(70));

        let cli = Cli::parse_from(["servercheck", "--alarm"]);
        assert_eq!(cli.mode(), Mode::Alarm);
    }

    #[test]
    fn modes_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["servercheck", "-a", "-n"]).is_err());
        assert!(Cli::try_parse_from(["servercheck", "--check", "--notify"]).is_err());
    }
}
