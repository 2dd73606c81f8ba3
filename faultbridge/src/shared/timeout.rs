// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Tracks a single budget across the waits performed while handling a fault.
///
/// `Instant::now()` is backed by `clock_gettime(CLOCK_MONOTONIC)`, which is async-signal-safe, so
/// this type can be created and queried from inside a signal handler.
pub struct TimeoutManager {
    start_time: Instant,
    timeout: Duration,
}

impl TimeoutManager {
    // 4ms per sched slice, give ~4x10 slices for safety
    pub(crate) const MINIMUM_REAP_TIME: Duration = Duration::from_millis(160);

    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    /// Time left in the budget, never less than [`Self::MINIMUM_REAP_TIME`] so that a child
    /// process can always be reaped.
    pub fn remaining(&self) -> Duration {
        self.timeout
            .saturating_sub(self.elapsed())
            .max(Self::MINIMUM_REAP_TIME)
    }

    /// Like [`Self::remaining`], in the `c_int` milliseconds `poll(2)` expects.
    pub fn remaining_ms(&self) -> i32 {
        self.remaining().as_millis().min(i32::MAX as u128) as i32
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_is_floored_at_reap_time() {
        let manager = TimeoutManager::new(Duration::from_millis(20));
        assert_eq!(manager.remaining(), TimeoutManager::MINIMUM_REAP_TIME);
        assert_eq!(
            manager.remaining_ms(),
            TimeoutManager::MINIMUM_REAP_TIME.as_millis() as i32
        );
    }

    #[test]
    fn fresh_manager_is_not_expired() {
        let manager = TimeoutManager::new(Duration::from_secs(5));
        assert!(!manager.expired());
        assert!(manager.remaining() > Duration::from_secs(4));
        assert_eq!(manager.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn expires_after_the_budget() {
        let manager = TimeoutManager::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(manager.expired());
        assert!(manager.elapsed() >= Duration::from_millis(5));
        assert_eq!(manager.remaining(), TimeoutManager::MINIMUM_REAP_TIME);
    }

    #[test]
    fn huge_timeouts_do_not_overflow_poll_argument() {
        let manager = TimeoutManager::new(Duration::from_secs(u64::MAX / 4));
        assert_eq!(manager.remaining_ms(), i32::MAX);
    }

    #[test]
    fn debug_output_names_fields() {
        let debug_str = format!("{:?}", TimeoutManager::new(Duration::from_secs(1)));
        assert!(debug_str.contains("TimeoutManager"));
        assert!(debug_str.contains("remaining"));
    }
}
