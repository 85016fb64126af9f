//! Client options and reconnection backoff.

use std::time::Duration;

use roomlink_core::close_codes;
use serde::{Deserialize, Serialize};

/// Reconnection backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectionPolicy {
    /// Whether to reconnect automatically after an unclean close.
    pub enabled: bool,
    /// Attempt budget. Zero means unlimited.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectionPolicy {
    /// Policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    /// Server URL.
    pub url: String,
    /// Reconnection behavior.
    pub reconnection: ReconnectionPolicy,
    /// Bound on a single connect attempt.
    pub connection_timeout_ms: u64,
    /// Keepalive ping period. Zero disables keepalive.
    pub ping_interval_ms: u64,
    /// Extra time a pong may lag behind before the link is declared dead.
    pub pong_timeout_ms: u64,
    /// Capacity of the outbound queue used while disconnected.
    pub max_queue_size: usize,
    /// Close codes that end the session without reconnecting.
    pub clean_close_codes: Vec<u16>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnection: ReconnectionPolicy::default(),
            connection_timeout_ms: 10_000,
            ping_interval_ms: 25_000,
            pong_timeout_ms: 10_000,
            max_queue_size: 100,
            clean_close_codes: vec![close_codes::NORMAL],
        }
    }
}

impl ClientOptions {
    /// Options for a URL with every other field at its default.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    #[must_use]
    pub const fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Whether `code` ends the session cleanly.
    #[must_use]
    pub fn is_clean_close(&self, code: u16) -> bool {
        self.clean_close_codes.contains(&code)
    }
}

/// Delay schedule for one client.
///
/// Each call to [`Backoff::next_delay`] consumes one attempt; the delay grows
/// by the multiplier and is capped at the policy maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectionPolicy,
    attempts: u32,
    next_ms: u64,
}

impl Backoff {
    #[must_use]
    pub const fn new(policy: ReconnectionPolicy) -> Self {
        let next_ms = policy.initial_delay_ms;
        Self {
            policy,
            attempts: 0,
            next_ms,
        }
    }

    /// Attempts consumed since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt budget is used up.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.policy.max_attempts > 0 && self.attempts >= self.policy.max_attempts
    }

    /// Consume one attempt and return its delay, or `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let delay = self.next_ms.min(self.policy.max_delay_ms);
        self.attempts += 1;
        self.next_ms = scale(delay, self.policy.backoff_multiplier).min(self.policy.max_delay_ms);
        Some(Duration::from_millis(delay))
    }

    /// Back to the initial delay with a full attempt budget.
    pub const fn reset(&mut self) {
        self.attempts = 0;
        self.next_ms = self.policy.initial_delay_ms;
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn scale(ms: u64, multiplier: f64) -> u64 {
    // A multiplier below 1 would shrink delays; clamp to keep the schedule non-decreasing.
    let scaled = (ms as f64) * multiplier.max(1.0);
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}
