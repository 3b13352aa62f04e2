//! Monotonic and realtime clock readers in microseconds.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static MONOTONIC_BASE: OnceLock<Instant> = OnceLock::new();

/// Microseconds since an arbitrary process-local epoch; never goes backwards.
#[inline]
pub fn monotonic_us() -> u64 {
    let base = MONOTONIC_BASE.get_or_init(Instant::now);
    base.elapsed().as_micros() as u64
}

/// Microseconds since the Unix epoch.
#[inline]
pub fn realtime_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
    }

    #[test]
    fn realtime_is_plausible() {
        // After 2020-01-01 in microseconds.
        assert!(realtime_us() > 1_577_836_800_000_000);
    }
}
