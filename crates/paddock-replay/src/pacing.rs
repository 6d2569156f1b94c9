//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Playback state machine and replay engine."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Paces a session's batch loop at the configured wall-clock interval and
/// accounts for the ticks it has released.
///
/// A tick missed under load is delayed rather than burst-replayed, so a
/// stalled loop never floods clients with catch-up batches. One tick
/// corresponds to one batch window; the running count feeds the session
/// diagnostics when a ticker winds down.
#[derive(Debug)]
pub struct BatchPacer {
    period: Duration,
    interval: tokio::time::Interval,
    ticks: u64,
}

impl BatchPacer {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            period,
            interval,
            ticks: 0,
        }
    }

    /// The wall-clock interval between released ticks.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of ticks released so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Wait for the next tick. The first tick releases immediately, which
    /// is what gives a fresh playback its instant first batch.
    pub async fn tick(&mut self) -> Instant {
        let released = self.interval.tick().await;
        self.ticks += 1;
        released
    }
}
