//! Busy-wait primitives: pause, exponential backoff, and a word spinlock.

use std::sync::atomic::{AtomicBool, Ordering};

/// CPU pause hint for spin loops.
#[inline]
pub fn pause() {
    std::hint::spin_loop();
}

/// Exponential backoff for contended busy-wait sites.
///
/// Spins `2^n` pauses per round up to a cap; callers that expect long waits
/// should yield their task between rounds instead of relying on the cap.
#[derive(Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const STEP_MAX: u32 = 10;

    pub fn new() -> Self {
        Backoff { step: 0 }
    }

    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..(1u32 << self.step) {
            pause();
        }
        if self.step < Self::STEP_MAX {
            self.step += 1;
        }
    }

    /// True once the backoff has reached its cap; a cooperative caller
    /// should start yielding between attempts.
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.step >= Self::STEP_MAX
    }
}

/// Minimal test-and-test-and-set spinlock guarding ring ends and the
/// combiner. Not reentrant; hold times must stay tiny.
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline]
    pub fn lock(&self) {
        let mut backoff = Backoff::new();
        loop {
            if self.try_lock() {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_excludes() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    lock.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }
}
