//! The dispatcher's single inbox. Every external occurrence the dispatch
//! loop reacts to — a bus delivery, a fired timer, a finished child
//! process, a lifecycle signal from the connection manager — becomes one
//! [`DispatcherMsg`] funneled through one channel. Processing them one at a
//! time off that channel is what makes the dispatcher a single cooperative
//! event loop (spec.md §5) even though the binary runs on a multi-threaded
//! tokio runtime: nothing but the task draining this channel ever touches
//! the FSM registry or the counters.

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::supervisor::{Outcome, SpawnError};

#[derive(Debug)]
pub enum DispatcherMsg {
    /// A message arrived on the bus for `target`.
    Bus { target: String, raw: Value },
    /// The showdown timer for this tracking id fired.
    Showdown { tracking_id: String },
    /// A spawned child for this tracking id has exited (or failed to spawn
    /// at all).
    ProcessOutcome {
        tracking_id: Option<String>,
        target: String,
        command: String,
        readable_command: String,
        result: Result<Outcome, SpawnError>,
    },
    /// The bus adapter successfully (re)established a session.
    Connected,
    /// Ask the dispatcher to shut down; outstanding FSMs are abandoned.
    Stop,
}

/// A cheaply-cloneable sender into the dispatcher's single inbox. Passed to
/// the bus adapter, the timers, and the process supervisor instead of a
/// direct reference to the dispatcher, which would otherwise require the
/// cyclic ownership the source's closures implied (spec.md §9).
pub type DispatcherHandle = UnboundedSender<DispatcherMsg>;
