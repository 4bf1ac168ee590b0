//! Connection Liveness
//!
//! The session loop pings on a fixed cadence and treats any inbound frame
//! as proof of life. A socket that stays silent past the idle timeout is
//! torn down and handed to the reconnect path.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::infrastructure::config::StreamSettings;

/// Ping cadence and idle budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between client pings.
    pub ping_interval: Duration,
    /// Silence that marks the connection dead.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(ping_interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            ping_interval,
            idle_timeout,
        }
    }

    /// Build from stream settings.
    #[must_use]
    pub const fn from_settings(settings: &StreamSettings) -> Self {
        Self::new(settings.heartbeat_interval, settings.idle_timeout)
    }
}

/// Tracks the last inbound activity of one session.
#[derive(Debug)]
pub struct LivenessMonitor {
    config: HeartbeatConfig,
    last_activity: Instant,
}

impl LivenessMonitor {
    /// Start monitoring from now.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_activity: Instant::now(),
        }
    }

    /// Record inbound traffic.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Ping timer. The first tick fires one interval from now.
    #[must_use]
    pub fn ping_timer(&self) -> Interval {
        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Fail if the connection has been silent too long.
    ///
    /// # Errors
    ///
    /// Returns `HeartbeatError::Idle` once the idle timeout has elapsed.
    pub fn check(&self) -> Result<(), HeartbeatError> {
        self.check_at(Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    ///
    /// # Errors
    ///
    /// Returns `HeartbeatError::Idle` once the idle timeout has elapsed.
    pub fn check_at(&self, now: Instant) -> Result<(), HeartbeatError> {
        let idle = now.saturating_duration_since(self.last_activity);
        if idle > self.config.idle_timeout {
            return Err(HeartbeatError::Idle(idle));
        }
        Ok(())
    }
}

/// Liveness failures.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Nothing received within the idle timeout.
    #[error("no traffic for {0:?}")]
    Idle(Duration),
}
