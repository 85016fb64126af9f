//! Ping/pong liveness tracking.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Foreground/background signal from the embedding application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Visibility {
    /// App is in front; missed ticks are caught up on return.
    #[default]
    Foreground,
    /// App is hidden.
    Background,
}

/// What to do on a keepalive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Link looks alive; send another ping.
    Ping,
    /// No pong within the grace window; force-close.
    Dead,
}

/// Liveness state for one open link.
///
/// The grace window is `ping_interval + pong_timeout`, so one lost ping cycle
/// is tolerated before the link is declared dead.
#[derive(Debug, Clone)]
pub struct Keepalive {
    ping_interval: Duration,
    pong_timeout: Duration,
    last_pong: Instant,
}

impl Keepalive {
    #[must_use]
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
            last_pong: Instant::now(),
        }
    }

    /// A zero ping interval disables keepalive.
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        self.ping_interval + self.pong_timeout
    }

    /// Treat the link as freshly opened.
    pub fn start(&mut self, now: Instant) {
        self.last_pong = now;
    }

    pub fn on_pong(&mut self, now: Instant) {
        self.last_pong = now;
    }

    #[must_use]
    pub const fn last_pong(&self) -> Instant {
        self.last_pong
    }

    /// Decide what a tick at `now` should do.
    #[must_use]
    pub fn check(&self, now: Instant) -> KeepaliveAction {
        if now.saturating_duration_since(self.last_pong) >= self.grace() {
            KeepaliveAction::Dead
        } else {
            KeepaliveAction::Ping
        }
    }

    /// Tick source whose first tick lands one interval from now.
    ///
    /// Returns `None` when keepalive is disabled.
    #[must_use]
    pub fn ticker(&self) -> Option<Interval> {
        if !self.enabled() {
            return None;
        }
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }
}
