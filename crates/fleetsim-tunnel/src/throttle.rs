//! Reconnect pacing shared by every session of a manager

use fleetsim_core::TunnelKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff on consecutive failures
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Gap before the next attempt after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Remembers the last connection attempt per (cluster, kind).
///
/// The record outlives individual sessions, so tearing a session down and
/// starting a new one cannot be used to dial faster than `min_interval`.
#[derive(Debug)]
pub struct ReconnectThrottle {
    min_interval: Duration,
    last_attempt: Mutex<HashMap<(String, TunnelKind), Instant>>,
}

impl ReconnectThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Reserve the next attempt slot and return how long to wait for it.
    ///
    /// The gap to the previous attempt is `max(min_interval, extra)`. The
    /// slot is recorded immediately, so concurrent callers queue behind
    /// each other instead of sharing a slot.
    pub fn reserve(&self, cluster: &str, kind: TunnelKind, extra: Duration) -> Duration {
        let gap = self.min_interval.max(extra);
        let now = Instant::now();
        let mut last = self.last_attempt.lock();
        let key = (cluster.to_string(), kind);
        let slot = match last.get(&key) {
            Some(prev) => (*prev + gap).max(now),
            None => now,
        };
        last.insert(key, slot);
        slot - now
    }

    /// Wait for the next attempt slot
    pub async fn wait_turn(&self, cluster: &str, kind: TunnelKind, extra: Duration) {
        let wait = self.reserve(cluster, kind, extra);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Drop the record for a deleted cluster
    pub fn forget(&self, cluster: &str) {
        self.last_attempt.lock().retain(|(c, _), _| c != cluster);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_spaced_by_min_interval() {
        let throttle = ReconnectThrottle::new(Duration::from_secs(5));
        let start = Instant::now();
        let mut attempts = Vec::new();
        for _ in 0..4 {
            throttle
                .wait_turn("alpha", TunnelKind::ClusterAgent, Duration::ZERO)
                .await;
            attempts.push(Instant::now());
        }

        assert_eq!(attempts[0], start);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let throttle = ReconnectThrottle::new(Duration::from_secs(5));
        throttle.wait_turn("alpha", TunnelKind::ClusterAgent, Duration::ZERO).await;

        assert!(throttle
            .reserve("alpha", TunnelKind::SteveProxy, Duration::ZERO)
            .is_zero());
        assert!(throttle
            .reserve("beta", TunnelKind::ClusterAgent, Duration::ZERO)
            .is_zero());
        assert_eq!(
            throttle.reserve("alpha", TunnelKind::ClusterAgent, Duration::ZERO),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_extends_gap_and_forget_resets() {
        let throttle = ReconnectThrottle::new(Duration::from_secs(1));
        throttle.reserve("alpha", TunnelKind::ClusterAgent, Duration::ZERO);
        assert_eq!(
            throttle.reserve("alpha", TunnelKind::ClusterAgent, Duration::from_secs(8)),
            Duration::from_secs(8)
        );

        throttle.forget("alpha");
        assert!(throttle
            .reserve("alpha", TunnelKind::ClusterAgent, Duration::ZERO)
            .is_zero());
    }
}
