//! Reconnect Policy
//!
//! Delay schedule between stream reconnect attempts. Finnhub asks for a
//! steady retry cadence, so the default is a fixed 5 second delay with no
//! jitter and no attempt limit; a multiplier above 1.0 turns the same
//! policy into capped exponential backoff.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::StreamSettings;

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Delay schedule configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt after a disconnect.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied after each attempt (1.0 = fixed delay).
    pub multiplier: f64,
    /// Random spread as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts before giving up (0 = never give up).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectConfig {
    /// Constant delay, unlimited attempts.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }

    /// Build from stream settings.
    #[must_use]
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay,
            max_delay: settings.reconnect_max_delay.max(settings.reconnect_delay),
            multiplier: settings.reconnect_multiplier,
            jitter_factor: settings.reconnect_jitter,
            max_attempts: settings.reconnect_max_attempts,
        }
    }
}

/// Stateful delay generator. Reset it after every successful connect.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a policy at attempt zero.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt.
    ///
    /// # Errors
    ///
    /// Returns `MaxAttemptsExceeded` once the configured limit is used up.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        if !self.should_retry() {
            return Err(ReconnectError::MaxAttemptsExceeded(self.config.max_attempts));
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);

        let grown = if self.config.multiplier.is_finite() && self.config.multiplier > 1.0 {
            scale(self.current_delay, self.config.multiplier, self.config.max_delay)
        } else {
            self.current_delay
        };
        self.current_delay = grown.min(self.config.max_delay);

        Ok(delay)
    }

    /// Back to the initial delay and zero attempts.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts handed out since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.config.jitter_factor.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        scale(delay, factor, delay).max(Duration::from_millis(1))
    }
}

/// `delay * factor`, or `fallback` when the product does not fit a
/// `Duration`.
fn scale(delay: Duration, factor: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(fallback)
}

/// Reconnect scheduling failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Attempt limit reached.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fixed_five_seconds() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        for _ in 0..10 {
            assert_eq!(policy.next_delay().unwrap(), Duration::from_secs(5));
        }
        assert_eq!(policy.attempt_count(), 10);
        assert!(policy.should_retry());
    }

    #[test]
    fn multiplier_grows_until_cap() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        });

        let delays: Vec<_> = (0..5).map(|_| policy.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: 2,
            ..ReconnectConfig::fixed(Duration::from_millis(10))
        });

        assert!(policy.next_delay().is_ok());
        assert!(policy.next_delay().is_ok());
        assert!(matches!(
            policy.next_delay(),
            Err(ReconnectError::MaxAttemptsExceeded(2))
        ));
        assert!(!policy.should_retry());
    }

    #[test]
    fn reset_restores_first_delay() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 3.0,
            jitter_factor: 0.0,
            max_attempts: 2,
        });
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        assert!(!policy.should_retry());

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                jitter_factor: 0.2,
                ..ReconnectConfig::fixed(Duration::from_secs(1))
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((800..=1200).contains(&millis), "delay {millis}ms out of band");
        }
    }

    #[test]
    fn huge_multiplier_saturates_at_cap() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 1e300,
            jitter_factor: 0.0,
            max_attempts: 0,
        });

        assert_eq!(policy.next_delay().unwrap(), Duration::from_secs(1));
        for _ in 0..5 {
            assert_eq!(policy.next_delay().unwrap(), Duration::from_secs(60));
        }
    }

    #[test]
    fn growth_near_duration_max_does_not_panic() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::MAX / 2,
            max_delay: Duration::MAX,
            multiplier: 4.0,
            jitter_factor: 0.5,
            max_attempts: 0,
        });

        for _ in 0..3 {
            assert!(policy.next_delay().unwrap() > Duration::ZERO);
        }
    }

    #[test]
    fn settings_carry_jitter() {
        let settings = StreamSettings {
            reconnect_jitter: 0.3,
            ..StreamSettings::default()
        };
        let config = ReconnectConfig::from_settings(&settings);
        assert!((config.jitter_factor - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn settings_never_cap_below_initial() {
        let settings = StreamSettings {
            reconnect_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(1),
            ..StreamSettings::default()
        };
        let config = ReconnectConfig::from_settings(&settings);
        assert_eq!(config.max_delay, Duration::from_secs(5));
    }
}
