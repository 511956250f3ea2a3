//! Health watchdog
//!
//! Fixed-interval liveness check, independent of the reconnect backoff.
//! Each tick either re-triggers `connect()` (session not listening) or, while
//! listening, pings the socket and flags the connection stale if
//! the previous ping saw no inbound frame at all.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::session::ConnectionState;

/// Result of a watchdog tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Listening with recent traffic, nothing to do
    Healthy,
    /// Not listening: ask for a connection (duplicates are tolerated)
    Reconnect,
    /// Listening: send a ping and expect any frame before the next tick
    SendPing,
    /// Listening, but nothing arrived since the last ping
    Stale,
}

#[derive(Debug)]
pub struct Watchdog {
    interval: Duration,
    ping_enabled: bool,
    awaiting_activity: bool,
}

impl Watchdog {
    pub fn new(interval: Duration, ping_enabled: bool) -> Self {
        Self {
            interval,
            ping_enabled,
            awaiting_activity: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Recurring timer; first tick one interval from now.
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Any inbound frame counts as proof of life.
    #[inline]
    pub fn record_activity(&mut self) {
        self.awaiting_activity = false;
    }

    /// Reset state for new connection
    pub fn reset(&mut self) {
        self.awaiting_activity = false;
    }

    pub fn check(&mut self, state: ConnectionState) -> WatchdogAction {
        if state != ConnectionState::Listening {
            self.awaiting_activity = false;
            return WatchdogAction::Reconnect;
        }
        if !self.ping_enabled {
            return WatchdogAction::Healthy;
        }
        if self.awaiting_activity {
            return WatchdogAction::Stale;
        }
        self.awaiting_activity = true;
        WatchdogAction::SendPing
    }
}
