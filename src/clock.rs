//! Clock/timer abstraction used by the voting FSM's showdown timer, the
//! connection watchdog, and the daily refresh — so tests can drive them
//! deterministically instead of sleeping in wall-clock time.
//!
//! The real implementation delegates to `tokio::time`, which means tests
//! can still use `tokio::time::pause`/`advance` for the sleeps themselves;
//! the abstraction exists to also control what `now()` reports, since
//! `chrono::Local::now()` cannot be paused.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
    async fn sleep(&self, duration: Duration);
}

/// Production clock: real wall time, real (pausable-under-test) sleeps.
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock with a settable `now()`; sleeps still go through
/// `tokio::time::sleep`, so pair this with `tokio::time::pause()`.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Local>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock().unwrap() = now;
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
