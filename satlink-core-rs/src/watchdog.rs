//! Satellite-side hub liveness watchdog
//!
//! The hub drains the accumulator every few milliseconds. If no drain is seen for
//! the configured timeout the hub is considered dead, even if the TCP link still
//! looks open, and the satellite restarts itself.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::accumulator::EventAccumulator;
use crate::interfaces::{DisconnectFlag, Restarter};

/// Why the watchdog stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// Hub went silent, restart requested
    Restarted,
    /// Polls stopped, but a disconnect had been announced
    DisconnectExpected,
}

pub struct Watchdog {
    accumulator: Arc<EventAccumulator>,
    disconnect: DisconnectFlag,
    restarter: Arc<dyn Restarter>,
    timeout: Duration,
}

impl Watchdog {
    pub fn new(
        accumulator: Arc<EventAccumulator>,
        disconnect: DisconnectFlag,
        restarter: Arc<dyn Restarter>,
        timeout: Duration,
    ) -> Self {
        Self {
            accumulator,
            disconnect,
            restarter,
            timeout,
        }
    }

    pub async fn run(&self) -> WatchdogExit {
        info!("Watching hub polls, timeout {:?}", self.timeout);

        loop {
            if tokio::time::timeout(self.timeout, self.accumulator.poll_seen())
                .await
                .is_ok()
            {
                continue;
            }

            if self.disconnect.is_expected() {
                info!("Hub stopped polling after an announced disconnect");
                return WatchdogExit::DisconnectExpected;
            }

            error!("Hub did not poll for {:?}, restarting", self.timeout);
            self.restarter.restart().await;
            return WatchdogExit::Restarted;
        }
    }
}
