//! In-process counters, periodically drained to a file for an external
//! collector to scrape. Grounded on `yadtreceiver.metrics` (`_write_metrics`
//! / `_reset_metrics` in the original): every counter is written as
//! `key=value` on its own line, then zeroed — a key that was already zero
//! at write time is dropped instead of being written again, which is how
//! the original file naturally shrinks back down once a counter goes
//! quiet. A generic metrics *server* (spec.md Non-goals) is not part of
//! this; only the write-to-file side is.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to create metrics directory {directory}: {source}")]
    CreateDir {
        directory: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write metrics file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
pub struct Counters {
    values: Mutex<HashMap<String, u64>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, key: &str) {
        let mut values = self.values.lock().unwrap();
        *values.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Renders every known counter as `key=value\n` (sorted for a stable
    /// file diff), then resets: counters already at zero are dropped,
    /// everything else goes back to zero for the next interval.
    pub fn snapshot(&self) -> String {
        let mut values = self.values.lock().unwrap();
        let mut keys: Vec<String> = values.keys().cloned().collect();
        keys.sort();

        let mut rendered = String::new();
        for key in &keys {
            let value = values[key];
            rendered.push_str(&format!("{key}={value}\n"));
        }

        values.retain(|_, value| {
            if *value == 0 {
                false
            } else {
                *value = 0;
                true
            }
        });

        rendered
    }
}

/// Writes a snapshot to `<metrics_directory>/<app_name>.metrics`, creating
/// the directory if it doesn't exist yet.
pub fn write_to_file(
    counters: &Counters,
    metrics_directory: &Path,
    app_name: &str,
) -> Result<PathBuf, MetricsError> {
    std::fs::create_dir_all(metrics_directory).map_err(|source| MetricsError::CreateDir {
        directory: metrics_directory.display().to_string(),
        source,
    })?;

    let path = metrics_directory.join(format!("{app_name}.metrics"));
    std::fs::write(&path, counters.snapshot()).map_err(|source| MetricsError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(path)
}
