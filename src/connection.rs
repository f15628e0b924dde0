//! Connection lifecycle manager: a reconnect watchdog with bounded
//! exponential backoff, and a scheduled daily connection refresh to defeat
//! long-lived NAT/intermediary connection drift (spec.md §4.E).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;

use crate::bus::BusAdapter;
use crate::clock::Clock;
use crate::messages::{DispatcherHandle, DispatcherMsg};

const WATCHDOG_BASELINE_SECS: u64 = 1;
const WATCHDOG_CEILING_SECS: u64 = 60;
const REFRESH_TICK: Duration = Duration::from_secs(60 * 60);
const REFRESH_LOCAL_HOUR: u32 = 2;

pub struct ConnectionManager {
    bus: Arc<dyn BusAdapter>,
    clock: Arc<dyn Clock>,
    dispatcher: DispatcherHandle,
}

impl ConnectionManager {
    pub fn new(bus: Arc<dyn BusAdapter>, clock: Arc<dyn Clock>, dispatcher: DispatcherHandle) -> Self {
        Self {
            bus,
            clock,
            dispatcher,
        }
    }

    /// Spawns the watchdog and daily-refresh loops as independent tasks
    /// sharing the same bus handle, and returns their join handles so the
    /// caller can decide whether to await or abandon them at shutdown.
    pub fn start(&self) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let watchdog = tokio::spawn(run_watchdog(
            Arc::clone(&self.bus),
            Arc::clone(&self.clock),
            self.dispatcher.clone(),
        ));
        let refresh = tokio::spawn(run_daily_refresh(Arc::clone(&self.bus), Arc::clone(&self.clock)));
        (watchdog, refresh)
    }
}

/// Doubles `delay` on each consecutive failure starting at
/// `WATCHDOG_BASELINE_SECS`, capped at `WATCHDOG_CEILING_SECS`: the
/// sequence after k failures (k=0 ⇒ baseline) is `min(60, 2^k)` (spec.md
/// testable property #4).
fn next_backoff(current: u64) -> u64 {
    current.saturating_mul(2).min(WATCHDOG_CEILING_SECS)
}

async fn run_watchdog(bus: Arc<dyn BusAdapter>, clock: Arc<dyn Clock>, dispatcher: DispatcherHandle) {
    let delay = AtomicU64::new(WATCHDOG_BASELINE_SECS);

    loop {
        if bus.is_connected() {
            delay.store(WATCHDOG_BASELINE_SECS, Ordering::SeqCst);
            clock.sleep(Duration::from_secs(1)).await;
            continue;
        }

        match bus.connect().await {
            Ok(()) => {
                tracing::info!("bus reconnected");
                delay.store(WATCHDOG_BASELINE_SECS, Ordering::SeqCst);
                let _ = dispatcher.send(DispatcherMsg::Connected);
                clock.sleep(Duration::from_secs(1)).await;
            }
            Err(err) => {
                let wait = delay.load(Ordering::SeqCst);
                tracing::warn!(%err, wait_secs = wait, "reconnect attempt failed");
                clock.sleep(Duration::from_secs(wait)).await;
                delay.store(next_backoff(wait), Ordering::SeqCst);
            }
        }
    }
}

/// Every hour, closes the bus link if the local hour is 02:xx and this is
/// not the very first tick (so a process started at 02:xx doesn't
/// immediately recycle a connection it just opened).
async fn run_daily_refresh(bus: Arc<dyn BusAdapter>, clock: Arc<dyn Clock>) {
    let mut first_tick = true;
    loop {
        clock.sleep(REFRESH_TICK).await;

        let is_refresh_hour = clock.now().hour() == REFRESH_LOCAL_HOUR;
        if is_refresh_hour && !first_tick && bus.is_connected() {
            tracing::info!("daily connection refresh: closing bus link");
            if let Err(err) = bus.close().await {
                tracing::warn!(%err, "failed to close bus link during daily refresh");
            }
        }
        first_tick = false;
    }
}
