//! Top-level error aggregation, mirroring the teacher's `events::Error` /
//! `node::result::NodeError` style: one enum per crate boundary, `#[from]`
//! conversions so call sites can use `?`, used at the few places (the CLI
//! entry point) that must turn a failure into a process exit code.

use crate::config::ConfigError;
use crate::events::EventError;
use crate::metrics::MetricsError;
use crate::supervisor::SpawnError;
use crate::target::TargetError;

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Bus(#[from] crate::bus::BusError),
}

pub type ReceiverResult<T> = Result<T, ReceiverError>;
