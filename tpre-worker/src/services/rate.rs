//! Per-policy usage accounting.
//!
//! Counters are best-effort by design: increments are lock-free once a
//! policy's counter exists, the window rolls over with a compare-exchange,
//! and readers never block the request path. A slightly late rollover can
//! admit a few extra requests; that is acceptable for a soft limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tpre_types::{Hrac, Timestamp};

struct WindowCounter {
    window_start: AtomicU64,
    count: AtomicU64,
}

/// Best-effort per-policy request budget over a rolling window.
#[derive(Clone)]
pub struct PolicyUsage {
    limit: u64,
    window: Duration,
    counters: Arc<RwLock<HashMap<Hrac, Arc<WindowCounter>>>>,
}

impl PolicyUsage {
    /// Creates the accountant with `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            counters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Records one request against `hrac` and reports whether it is within
    /// budget.
    pub fn check_and_record(&self, hrac: Hrac, now: Timestamp) -> bool {
        let counter = {
            let counters = self.counters.read();
            counters.get(&hrac).cloned()
        };
        let counter = match counter {
            Some(counter) => counter,
            None => {
                let mut counters = self.counters.write();
                Arc::clone(counters.entry(hrac).or_insert_with(|| {
                    Arc::new(WindowCounter {
                        window_start: AtomicU64::new(now.as_secs()),
                        count: AtomicU64::new(0),
                    })
                }))
            }
        };

        let window_start = counter.window_start.load(Ordering::Relaxed);
        if now.as_secs().saturating_sub(window_start) >= self.window.as_secs()
            && counter
                .window_start
                .compare_exchange(
                    window_start,
                    now.as_secs(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            counter.count.store(0, Ordering::Relaxed);
        }

        let used = counter.count.fetch_add(1, Ordering::Relaxed);
        used < self.limit
    }

    /// Requests recorded for `hrac` in the current window.
    pub fn used(&self, hrac: Hrac) -> u64 {
        self.counters
            .read()
            .get(&hrac)
            .map(|counter| counter.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced_within_a_window() {
        let usage = PolicyUsage::new(3, Duration::from_secs(60));
        let hrac = Hrac::from_bytes([1u8; 16]);
        let now = Timestamp::from_secs(1_700_000_000);

        assert!(usage.check_and_record(hrac, now));
        assert!(usage.check_and_record(hrac, now));
        assert!(usage.check_and_record(hrac, now));
        assert!(!usage.check_and_record(hrac, now));
        assert_eq!(usage.used(hrac), 4);
    }

    #[test]
    fn window_rollover_resets_the_budget() {
        let usage = PolicyUsage::new(1, Duration::from_secs(60));
        let hrac = Hrac::from_bytes([2u8; 16]);
        let now = Timestamp::from_secs(1_700_000_000);

        assert!(usage.check_and_record(hrac, now));
        assert!(!usage.check_and_record(hrac, now));

        let later = now.saturating_add(Duration::from_secs(61));
        assert!(usage.check_and_record(hrac, later));
    }

    #[test]
    fn policies_are_accounted_independently() {
        let usage = PolicyUsage::new(1, Duration::from_secs(60));
        let now = Timestamp::from_secs(1_700_000_000);
        let a = Hrac::from_bytes([3u8; 16]);
        let b = Hrac::from_bytes([4u8; 16]);

        assert!(usage.check_and_record(a, now));
        assert!(usage.check_and_record(b, now));
        assert!(!usage.check_and_record(a, now));
    }
}
