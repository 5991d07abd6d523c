//! Fixed-window rate-limit ledger.
//!
//! Time is cut into equal buckets of `window_ms`; each `(key, window_start)`
//! pair counts admissions in its bucket. Counts reset at bucket boundaries,
//! so a burst straddling a boundary can admit up to twice the ceiling within
//! one window span.

use std::collections::HashMap;

use tracing::debug;

/// Admission counts per key and window.
#[derive(Debug)]
pub struct RateLimitLedger {
    counts: HashMap<(String, i64), u32>,
    window_ms: i64,
    max_per_window: u32,
}

impl RateLimitLedger {
    pub fn new(window_ms: u64, max_per_window: u32) -> Self {
        Self {
            counts: HashMap::new(),
            window_ms: i64::try_from(window_ms.max(1)).unwrap_or(i64::MAX),
            max_per_window,
        }
    }

    /// Start of the window containing `now_ms`.
    pub fn window_start(&self, now_ms: i64) -> i64 {
        now_ms.div_euclid(self.window_ms) * self.window_ms
    }

    /// Count one request for `key` at `now_ms` if its window has room.
    ///
    /// Returns `false` without touching the count when the window is full.
    /// Stale windows are swept on every call, admitted or not.
    pub fn try_admit(&mut self, key: &str, now_ms: i64) -> bool {
        let window_start = self.window_start(now_ms);
        self.sweep(window_start);

        let count = self
            .counts
            .entry((key.to_string(), window_start))
            .or_insert(0);
        if *count >= self.max_per_window {
            debug!(
                key = key,
                window_start = window_start,
                count = *count,
                max = self.max_per_window,
                "rate limit exceeded"
            );
            return false;
        }
        *count += 1;
        true
    }

    /// Drop windows that started more than two window widths before
    /// `window_start`.
    pub fn sweep(&mut self, window_start: i64) {
        let horizon = window_start.saturating_sub(2 * self.window_ms);
        let before = self.counts.len();
        self.counts.retain(|(_, start), _| *start >= horizon);
        let removed = before - self.counts.len();
        if removed > 0 {
            debug!(removed = removed, "swept stale rate-limit windows");
        }
    }

    /// Admissions recorded for `key` in the window containing `now_ms`.
    pub fn count(&self, key: &str, now_ms: i64) -> u32 {
        let window_start = self.window_start(now_ms);
        self.counts
            .get(&(key.to_string(), window_start))
            .copied()
            .unwrap_or(0)
    }

    /// Number of `(key, window)` entries currently held.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_floors_to_window() {
        let ledger = RateLimitLedger::new(1000, 10);
        assert_eq!(ledger.window_start(0), 0);
        assert_eq!(ledger.window_start(999), 0);
        assert_eq!(ledger.window_start(1000), 1000);
        assert_eq!(ledger.window_start(12_345), 12_000);
    }

    #[test]
    fn test_allows_ceiling_then_denies() {
        let mut ledger = RateLimitLedger::new(1000, 10);
        for _ in 0..10 {
            assert!(ledger.try_admit("like-1", 5_100));
        }
        assert!(!ledger.try_admit("like-1", 5_900));
        // A denied request does not push the count past the ceiling.
        assert_eq!(ledger.count("like-1", 5_500), 10);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut ledger = RateLimitLedger::new(1000, 2);
        assert!(ledger.try_admit("like-1", 0));
        assert!(ledger.try_admit("like-1", 1));
        assert!(!ledger.try_admit("like-1", 2));
        assert!(ledger.try_admit("like-2", 3));
    }

    #[test]
    fn test_new_window_resets_count() {
        let mut ledger = RateLimitLedger::new(1000, 3);
        for _ in 0..3 {
            assert!(ledger.try_admit("k", 1_500));
        }
        assert!(!ledger.try_admit("k", 1_999));
        assert!(ledger.try_admit("k", 2_000));
    }

    #[test]
    fn test_boundary_burst_admits_twice_the_ceiling() {
        let mut ledger = RateLimitLedger::new(1000, 10);
        let admitted_late = (0..10).filter(|_| ledger.try_admit("k", 999)).count();
        let admitted_early = (0..10).filter(|_| ledger.try_admit("k", 1_000)).count();
        assert_eq!(admitted_late + admitted_early, 20);
    }

    #[test]
    fn test_sweep_drops_windows_older_than_two_widths() {
        let mut ledger = RateLimitLedger::new(1000, 10);
        ledger.try_admit("a", 0);
        ledger.try_admit("b", 1_000);
        ledger.try_admit("c", 2_000);
        assert_eq!(ledger.len(), 3);

        // Window 3000: horizon is 1000, so only window 0 goes.
        ledger.try_admit("d", 3_000);
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.count("a", 0), 0);
        assert_eq!(ledger.count("b", 1_000), 1);

        ledger.sweep(10_000);
        assert!(ledger.is_empty());
    }
}
