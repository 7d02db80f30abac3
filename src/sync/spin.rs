//! Bounded busy-waiting: spin first, then sleep, then give up

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// How long a lock acquisition may wait before reporting `WouldBlock`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinPolicy {
    /// Busy spins before the first sleep
    pub max_spins: u32,
    /// Sleep between checks once spinning is exhausted
    pub sleep: Duration,
    /// Total sleep budget before giving up
    pub max_wait: Duration,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self {
            max_spins: 10_000,
            sleep: Duration::from_millis(1),
            max_wait: Duration::from_secs(1),
        }
    }
}

impl SpinPolicy {
    pub fn new(max_spins: u32, sleep: Duration, max_wait: Duration) -> Self {
        Self {
            max_spins,
            sleep,
            max_wait,
        }
    }

    /// Pure spinning with no sleep phase, still bounded by `max_wait`
    pub fn spin_only(max_wait: Duration) -> Self {
        Self {
            max_spins: u32::MAX,
            sleep: Duration::ZERO,
            max_wait,
        }
    }

    /// Never give up
    pub fn unbounded() -> Self {
        Self {
            max_wait: Duration::MAX,
            ..Self::default()
        }
    }
}

/// Per-wait state driven by a [`SpinPolicy`]
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a SpinPolicy,
    spins: u32,
    waited: Duration,
    started: Option<std::time::Instant>,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a SpinPolicy) -> Self {
        Self {
            policy,
            spins: 0,
            waited: Duration::ZERO,
            started: None,
        }
    }

    /// Wait one step, or fail once the budget is exhausted
    pub fn snooze(&mut self, operation: &str) -> Result<()> {
        if self.spins < self.policy.max_spins {
            self.spins += 1;
            if self.policy.sleep.is_zero() {
                // spin-only policies are bounded by wall time
                let started = *self.started.get_or_insert_with(std::time::Instant::now);
                if started.elapsed() > self.policy.max_wait {
                    return Err(self.exhausted(operation, started.elapsed()));
                }
            }
            std::hint::spin_loop();
            return Ok(());
        }

        if self.waited >= self.policy.max_wait {
            return Err(self.exhausted(operation, self.waited));
        }

        if self.policy.sleep.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.policy.sleep);
        }
        self.waited = self.waited.saturating_add(self.policy.sleep);
        Ok(())
    }

    fn exhausted(&self, operation: &str, waited: Duration) -> StoreError {
        StoreError::would_block(operation, waited.as_micros().min(u64::MAX as u128) as u64)
    }

    /// Number of spins performed so far
    pub fn spins(&self) -> u32 {
        self.spins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_backoff_exhausts() {
        let policy = SpinPolicy::new(5, Duration::from_micros(50), Duration::from_micros(200));
        let mut backoff = Backoff::new(&policy);

        let mut steps = 0;
        let err = loop {
            match backoff.snooze("wait") {
                Ok(()) => steps += 1,
                Err(e) => break e,
            }
        };

        assert_eq!(err.code(), ErrorCode::WouldBlock);
        assert_eq!(backoff.spins(), 5);
        assert_eq!(steps, 5 + 4);
    }

    #[test]
    fn test_spin_only_is_time_bounded() {
        let policy = SpinPolicy::spin_only(Duration::from_millis(5));
        let mut backoff = Backoff::new(&policy);
        let start = std::time::Instant::now();
        while backoff.snooze("spin").is_ok() {}
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
