//! Sample data structure for servercheck.
//!
//! This module defines the [`Sample`] struct, one snapshot of the watched
//! metrics, and its history-file encoding: one JSON object per line with
//! the field names `datetime`, `tempinfo`, `cpuinfo`, `meminfo` and
//! `diskinfo`.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Temperature per CPU package id, in whole °C.
pub type TempInfo = BTreeMap<String, i64>;

/// Usage per partition in %, in configured order. `None` means the
/// partition was requested but not found in the probe output.
pub type DiskInfo = IndexMap<String, Option<i64>>;

/// Snapshot of the watched metrics at one point in time.
///
/// # Field Categories
///
/// - **Timestamp**: local wall-clock time of collection
/// - **Temperatures**: one reading per CPU package, possibly none
/// - **CPU / Memory**: utilisation percentages
/// - **Disks**: one entry per requested partition, always present
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Sample {
    /// Local time of collection, ISO 8601 without offset
    pub datetime: NaiveDateTime,

    /// Package temperatures. Empty if the sensor command failed
    #[serde(default, deserialize_with = "null_as_default")]
    pub tempinfo: TempInfo,

    /// Average CPU usage across all cores (0-100%)
    pub cpuinfo: f64,

    /// Used memory (0-100%)
    pub meminfo: f64,

    /// Partition usage, keyed by mount point
    #[serde(default, deserialize_with = "null_as_default")]
    pub diskinfo: DiskInfo,
}

impl Sample {
    /// Hottest package temperature, if any package reported one.
    pub fn max_temperature(&self) -> Option<i64> {
        self.tempinfo.values().copied().max()
    }

    /// Encode as one history-file line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode one history-file line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Older history files store `null` when a probe failed outright.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
