//! Delay gate between failed reconnect attempts.

use std::time::{Duration, Instant};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::BackoffPolicy;

/// Tracks failed reconnect attempts and decides when the next one may dial.
///
/// There is no attempt limit: the gate only spaces attempts out.
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    current: Duration,
    not_before: Option<Instant>,
    rng: StdRng,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.base(),
            not_before: None,
            rng: StdRng::from_entropy(),
            policy,
        }
    }

    /// Whether an attempt may be made at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| now >= at)
    }

    /// Arm the gate after a failure and grow the delay for the next one.
    /// Returns the delay that was applied.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let max_ms = self.current.as_millis().min(u128::from(u64::MAX)) as u64;
        let delay = if max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(max_ms / 2..=max_ms))
        };
        self.not_before = Some(now + delay);
        self.current = self.current.saturating_mul(2).min(self.policy.cap());
        delay
    }

    pub fn record_success(&mut self) {
        self.current = self.policy.base();
        self.not_before = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64) -> BackoffPolicy {
        BackoffPolicy { base_ms, cap_ms }
    }

    #[test]
    fn ready_until_first_failure() {
        let backoff = ReconnectBackoff::new(policy(100, 1_000));
        assert!(backoff.ready(Instant::now()));
    }

    #[test]
    fn failure_closes_gate_within_bounds() {
        let mut backoff = ReconnectBackoff::new(policy(100, 1_000));
        let now = Instant::now();
        let delay = backoff.record_failure(now);
        assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(100));
        assert!(!backoff.ready(now));
        assert!(backoff.ready(now + Duration::from_millis(100)));
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let mut backoff = ReconnectBackoff::new(policy(100, 300));
        let now = Instant::now();
        backoff.record_failure(now);
        backoff.record_failure(now);
        let third = backoff.record_failure(now);
        assert!(third >= Duration::from_millis(150) && third <= Duration::from_millis(300));
        let fourth = backoff.record_failure(now);
        assert!(fourth <= Duration::from_millis(300));
    }

    #[test]
    fn success_resets() {
        let mut backoff = ReconnectBackoff::new(policy(100, 1_000));
        let now = Instant::now();
        backoff.record_failure(now);
        backoff.record_failure(now);
        backoff.record_success();
        assert!(backoff.ready(now));
        let delay = backoff.record_failure(now);
        assert!(delay <= Duration::from_millis(100));
    }

    #[test]
    fn zero_policy_never_blocks() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy::none());
        let now = Instant::now();
        assert_eq!(backoff.record_failure(now), Duration::ZERO);
        assert!(backoff.ready(now));
    }
}
