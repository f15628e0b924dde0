//! Rotating file log sink plus `tracing_subscriber` wiring. Grounded on
//! `telemetry::subscriber::TelemetrySubscriber::init`, generalized from
//! "pretty vs JSON to stdout" to "a size-based rotating file sink" per
//! spec.md §6: 20 MB per file, at most 10 rotated files retained.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::TryInitError;

const MAX_FILE_BYTES: u64 = 20_000_000;
const MAX_ROTATED_FILES: u32 = 10;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to initialize tracing subscriber: {0}")]
    Init(#[from] TryInitError),

    #[error("failed to open log file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
}

struct RotatingState {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingState {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self { path, file, written })
    }

    fn rotate(&mut self) -> io::Result<()> {
        for index in (1..MAX_ROTATED_FILES).rev() {
            let from = rotated_path(&self.path, index);
            let to = rotated_path(&self.path, index + 1);
            if from.exists() {
                fs::rename(from, to)?;
            }
        }
        let oldest = rotated_path(&self.path, MAX_ROTATED_FILES);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        fs::rename(&self.path, rotated_path(&self.path, 1))?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// A `std::io::Write` + `MakeWriter` sink that rotates the underlying file
/// once it would exceed [`MAX_FILE_BYTES`], keeping at most
/// [`MAX_ROTATED_FILES`] old copies (`<name>.1` newest .. `<name>.10`
/// oldest, which is dropped on the next rotation).
#[derive(Clone)]
pub struct RotatingFileWriter {
    state: std::sync::Arc<Mutex<RotatingState>>,
}

impl RotatingFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, LoggingError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| LoggingError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }
        let state = RotatingState::open(path.clone()).map_err(|source| LoggingError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            state: std::sync::Arc::new(Mutex::new(state)),
        })
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.written + buf.len() as u64 > MAX_FILE_BYTES {
            state.rotate()?;
        }
        let written = state.file.write(buf)?;
        state.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initializes the global `tracing` subscriber against the given writer.
/// Kept as a thin wrapper (mirroring the teacher's `TelemetrySubscriber::init`)
/// so tests can pass `tracing_subscriber::fmt::TestWriter` instead.
pub fn init<W>(out: W) -> Result<(), LoggingError>
where
    W: for<'w> MakeWriter<'w> + 'static + Send + Sync,
{
    tracing_subscriber::fmt()
        .with_writer(out)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()?;
    Ok(())
}
