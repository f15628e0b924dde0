//! Per-host agent that subscribes to a broadcaster bus and executes
//! administrative commands against local target directories, with
//! at-most-one-executor guaranteed across peer agents via a voting
//! protocol (see `DESIGN.md` for how each module is grounded).

pub mod bus;
pub mod cli;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod messages;
pub mod metrics;
pub mod supervisor;
pub mod target;
pub mod voting;
