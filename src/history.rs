//! History store for servercheck.
//!
//! The history file holds one [`Sample`] per line and only ever grows: each
//! run appends exactly one record. Evaluation and charts only look at the
//! trailing `datapoints` records, loaded into a [`HistoryWindow`].
//!
//! Runs are assumed not to overlap. There is no file locking, so two
//! concurrent invocations may interleave their appends.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::Sample;

/// Default history file name, relative to the working directory.
pub const HISTORY_FILE: &str = "status_log.json";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to encode sample: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The most recent samples, oldest first.
#[derive(Clone, Debug, Default)]
pub struct HistoryWindow {
    samples: VecDeque<Sample>,
}

impl HistoryWindow {
    /// Keep only the trailing `retention` samples of `samples`.
    pub fn from_trailing(samples: impl IntoIterator<Item = Sample>, retention: usize) -> Self {
        let mut window = VecDeque::with_capacity(retention + 1);
        for sample in samples {
            if retention == 0 {
                continue;
            }
            if window.len() == retention {
                window.pop_front();
            }
            window.push_back(sample);
        }
        Self { samples: window }
    }

    /// Add the current sample. The window may exceed the retention by one.
    pub fn push(&mut self, sample: Sample) {
        self.samples.push_back(sample);
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Append-only, newline-delimited sample log.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    path: PathBuf,
    retention: usize,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            path: path.into(),
            retention,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the trailing window. A missing file is an empty history.
    ///
    /// Lines that fail to decode are skipped with a warning and left in
    /// the file untouched.
    pub fn load(&self) -> Result<HistoryWindow, HistoryError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no history yet");
                return Ok(HistoryWindow::default());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        let mut samples = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| self.io_error(source))?;
            if line.trim().is_empty() {
                continue;
            }
            match Sample::from_line(&line) {
                Ok(sample) => samples.push(sample),
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping unreadable history record"
                ),
            }
        }

        let window = HistoryWindow::from_trailing(samples, self.retention);
        debug!(records = window.len(), retention = self.retention, "loaded history window");
        Ok(window)
    }

    /// Append one record to the file, creating it if needed.
    pub fn append(&self, sample: &Sample) -> Result<(), HistoryError> {
        let mut line = sample.to_line()?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
