//! Restart policy for vault workers.
//!
//! A worker that exits without a requested shutdown is restarted with
//! exponential backoff until the restart ceiling is reached, at which point
//! the vault is marked failed and its owner notified.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::humantime_serde;

/// Restart policy applied to a supervised vault worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Maximum number of restarts before the vault is marked failed.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before the first restart.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Ceiling applied to the backoff delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay on each successive restart.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

const fn default_max_restarts() -> u32 {
    5
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl RestartPolicy {
    /// Calculates the backoff delay for a given restart attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // attempt count stays far below i32::MAX
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs).min(self.max_delay)
    }
}

/// Tracks restart attempts for one worker instance.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    attempts: u32,
}

impl RestartTracker {
    /// Creates a tracker for the given policy.
    #[must_use]
    pub const fn new(policy: RestartPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Returns `true` while another restart is permitted.
    #[must_use]
    pub const fn should_restart(&self) -> bool {
        self.attempts < self.policy.max_restarts
    }

    /// Records a restart and returns the delay to apply before it.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        self.policy.delay_for_attempt(self.attempts)
    }

    /// Resets the attempt counter after a successful run.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Number of restarts recorded since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_up_to_the_ceiling() {
        let policy = RestartPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn tracker_stops_at_the_restart_ceiling() {
        let policy = RestartPolicy {
            max_restarts: 3,
            ..Default::default()
        };
        let mut tracker = RestartTracker::new(policy);

        for _ in 0..3 {
            assert!(tracker.should_restart());
            tracker.next_delay();
        }
        assert!(!tracker.should_restart());
        assert_eq!(tracker.attempts(), 3);
    }

    #[test]
    fn reset_clears_the_attempt_counter() {
        let mut tracker = RestartTracker::new(RestartPolicy::default());
        tracker.next_delay();
        tracker.next_delay();
        assert_eq!(tracker.attempts(), 2);

        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
        assert!(tracker.should_restart());
        assert_eq!(tracker.next_delay(), Duration::from_secs(1));
    }
}
