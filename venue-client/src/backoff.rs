//! Reconnect backoff for the shared socket

use std::time::Duration;

use rand::Rng;

/// First retry delay
const RECONNECT_DELAY_BASE: Duration = Duration::from_millis(500);

/// Upper bound for any single retry delay
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// +/- 20% around the exponential delay
const RECONNECT_JITTER_RATIO: f64 = 0.2;

/// Exponential backoff with jitter and a bounded interval
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay used as a symmetric random spread
    pub jitter_ratio: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: RECONNECT_DELAY_BASE,
            max: RECONNECT_DELAY_MAX,
            jitter_ratio: RECONNECT_JITTER_RATIO,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let bounded = self.base.saturating_mul(1u32 << exponent).min(self.max);

        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || bounded.is_zero() {
            return bounded;
        }

        let factor = rand::rng().random_range((1.0 - ratio)..=(1.0 + ratio));
        bounded.mul_f64(factor).min(self.max)
    }

    /// Whether attempt `attempt` (1-based) is still allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

/// Attempt counter for one connection loop
#[derive(Debug, Default)]
pub struct ReconnectState {
    attempt: u32,
}

impl ReconnectState {
    /// A session completed its handshake
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Count a failed or dropped session and return the wait before the
    /// next one, or `None` once the policy gives up
    pub fn next_delay(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        policy
            .should_retry(self.attempt)
            .then(|| policy.delay(self.attempt))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = ReconnectPolicy {
            jitter_ratio: 0.0,
            ..ReconnectPolicy::default()
        };

        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(4), Duration::from_secs(4));
        assert_eq!(policy.delay(10), RECONNECT_DELAY_MAX);
        assert_eq!(policy.delay(500), RECONNECT_DELAY_MAX);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..12 {
            let delay = policy.delay(attempt);
            assert!(delay <= RECONNECT_DELAY_MAX, "attempt {} gave {:?}", attempt, delay);
            assert!(delay >= Duration::from_millis(400), "attempt {} gave {:?}", attempt, delay);
        }
    }

    #[test]
    fn test_attempt_limit() {
        let unlimited = ReconnectPolicy::default();
        assert!(unlimited.should_retry(10_000));

        let limited = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::default()
        };
        assert!(limited.should_retry(3));
        assert!(!limited.should_retry(4));
    }

    #[test]
    fn test_failed_handshakes_keep_backing_off() {
        let policy = ReconnectPolicy {
            jitter_ratio: 0.0,
            ..ReconnectPolicy::default()
        };
        let mut state = ReconnectState::default();

        // Socket opens but the handshake never completes: no reset
        assert_eq!(state.next_delay(&policy), Some(Duration::from_millis(500)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(1)));
        assert_eq!(state.next_delay(&policy), Some(Duration::from_secs(2)));
        assert_eq!(state.attempt(), 3);

        state.reset();
        assert_eq!(state.next_delay(&policy), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_exhausted_attempts_stop_the_loop() {
        let policy = ReconnectPolicy {
            max_attempts: Some(2),
            jitter_ratio: 0.0,
            ..ReconnectPolicy::default()
        };
        let mut state = ReconnectState::default();
        assert!(state.next_delay(&policy).is_some());
        assert!(state.next_delay(&policy).is_some());
        assert_eq!(state.next_delay(&policy), None);
    }
}
