//! Bucketed timer queue keyed by monotonic microseconds.
//!
//! Timers land in fixed-width buckets; a tick pops every bucket whose span
//! is fully or partially due and fires the entries whose expiry has passed.
//! Periodic timers are re-inserted with `expiry += period`.

use std::collections::BTreeMap;
use std::task::Waker;

/// Default bucket width: 500µs, the granularity the dispatcher cares about.
pub const BUCKET_WIDTH_US: u64 = 500;

pub struct Timer {
    pub expiry_us: u64,
    pub period_us: Option<u64>,
    pub waker: Waker,
}

pub struct TimeQ {
    buckets: BTreeMap<u64, Vec<Timer>>,
    width_us: u64,
    len: usize,
}

impl TimeQ {
    pub fn new() -> Self {
        Self::with_width(BUCKET_WIDTH_US)
    }

    pub fn with_width(width_us: u64) -> Self {
        assert!(width_us > 0);
        TimeQ {
            buckets: BTreeMap::new(),
            width_us,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, timer: Timer) {
        let key = timer.expiry_us / self.width_us;
        self.buckets.entry(key).or_default().push(timer);
        self.len += 1;
    }

    /// Earliest possible expiry, rounded down to its bucket start.
    pub fn next_expiry_us(&self) -> Option<u64> {
        self.buckets
            .iter()
            .next()
            .map(|(key, bucket)| {
                bucket
                    .iter()
                    .map(|t| t.expiry_us)
                    .min()
                    .unwrap_or(key * self.width_us)
            })
    }

    /// Fire every timer with `expiry <= now`. Returns the number fired.
    pub fn tick(&mut self, now_us: u64) -> usize {
        let due_key = now_us / self.width_us;
        let mut fired = 0;
        let mut periodic = Vec::new();

        let due_keys: Vec<u64> = self
            .buckets
            .range(..=due_key)
            .map(|(&key, _)| key)
            .collect();
        for key in due_keys {
            let mut bucket = self.buckets.remove(&key).unwrap();
            let mut keep = Vec::new();
            for timer in bucket.drain(..) {
                if timer.expiry_us <= now_us {
                    fired += 1;
                    self.len -= 1;
                    timer.waker.wake_by_ref();
                    if let Some(period) = timer.period_us {
                        periodic.push(Timer {
                            expiry_us: timer.expiry_us + period,
                            period_us: Some(period),
                            waker: timer.waker,
                        });
                    }
                } else {
                    keep.push(timer);
                }
            }
            if !keep.is_empty() {
                self.buckets.insert(key, keep);
            }
        }

        for timer in periodic {
            self.insert(timer);
        }
        fired
    }
}

impl Default for TimeQ {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountWaker(AtomicUsize);

    impl Wake for CountWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountWaker>, Waker) {
        let count = Arc::new(CountWaker(AtomicUsize::new(0)));
        let waker = Waker::from(count.clone());
        (count, waker)
    }

    #[test]
    fn fires_due_timers_only() {
        let mut timeq = TimeQ::with_width(100);
        let (early, early_waker) = counting_waker();
        let (late, late_waker) = counting_waker();
        timeq.insert(Timer {
            expiry_us: 1_000,
            period_us: None,
            waker: early_waker,
        });
        timeq.insert(Timer {
            expiry_us: 5_000,
            period_us: None,
            waker: late_waker,
        });

        assert_eq!(timeq.tick(500), 0);
        assert_eq!(timeq.tick(1_000), 1);
        assert_eq!(early.0.load(Ordering::SeqCst), 1);
        assert_eq!(late.0.load(Ordering::SeqCst), 0);
        assert_eq!(timeq.tick(10_000), 1);
        assert_eq!(late.0.load(Ordering::SeqCst), 1);
        assert!(timeq.is_empty());
    }

    #[test]
    fn same_bucket_mixed_due() {
        let mut timeq = TimeQ::with_width(1_000);
        let (a, a_waker) = counting_waker();
        let (b, b_waker) = counting_waker();
        timeq.insert(Timer {
            expiry_us: 100,
            period_us: None,
            waker: a_waker,
        });
        timeq.insert(Timer {
            expiry_us: 900,
            period_us: None,
            waker: b_waker,
        });
        assert_eq!(timeq.tick(100), 1);
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 0);
        assert_eq!(timeq.len(), 1);
        assert_eq!(timeq.tick(900), 1);
    }

    #[test]
    fn periodic_rearms() {
        let mut timeq = TimeQ::with_width(100);
        let (count, waker) = counting_waker();
        timeq.insert(Timer {
            expiry_us: 1_000,
            period_us: Some(1_000),
            waker,
        });
        assert_eq!(timeq.tick(1_000), 1);
        assert_eq!(timeq.tick(2_000), 1);
        assert_eq!(timeq.tick(3_500), 1);
        assert_eq!(count.0.load(Ordering::SeqCst), 3);
        assert_eq!(timeq.len(), 1);
    }

    #[test]
    fn next_expiry_reports_earliest() {
        let mut timeq = TimeQ::with_width(100);
        assert_eq!(timeq.next_expiry_us(), None);
        let (_, waker) = counting_waker();
        timeq.insert(Timer {
            expiry_us: 7_700,
            period_us: None,
            waker: waker.clone(),
        });
        timeq.insert(Timer {
            expiry_us: 3_300,
            period_us: None,
            waker,
        });
        assert_eq!(timeq.next_expiry_us(), Some(3_300));
    }
}
