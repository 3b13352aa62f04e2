//! Cache entries.
//!
//! An entry is an immutable key/value pair plus its flags, the exptime the
//! client supplied (stored but never acted on: entries do not expire on
//! their own), and a CAS stamp assigned when the entry is linked into its
//! partition. The `Arc` strong count is the entry's reference count: the
//! partition table holds one reference, every in-flight command result
//! holds one, and every spliced transmit region holds one through its
//! `Bytes` view of the value. The entry is freed when the last goes away.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// Keys are at most 250 bytes, as on the wire.
pub const KEY_LEN_MAX: usize = 250;

/// Per-entry accounting overhead charged against the partition volume.
pub const ENTRY_OVERHEAD: usize = 64;

pub struct Entry {
    key: Bytes,
    value: Bytes,
    flags: u32,
    exptime: u32,
    /// Assigned under the partition's serialization when the entry is
    /// inserted; zero until then.
    stamp: AtomicU64,
    /// CLOCK second-chance bit, set on lookup hits.
    used: AtomicBool,
    /// Backlink into the partition's clock list.
    clock_pos: AtomicU32,
}

impl Entry {
    pub fn new(key: Bytes, value: Bytes, flags: u32, exptime: u32) -> Arc<Entry> {
        debug_assert!(key.len() <= KEY_LEN_MAX);
        Arc::new(Entry {
            key,
            value,
            flags,
            exptime,
            stamp: AtomicU64::new(0),
            used: AtomicBool::new(false),
            clock_pos: AtomicU32::new(0),
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// A refcounted view of the value for zero-copy transmission.
    pub fn value_bytes(&self) -> Bytes {
        self.value.clone()
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    pub fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    pub(crate) fn set_stamp(&self, stamp: u64) {
        self.stamp.store(stamp, Ordering::Release);
    }

    /// Bytes charged against the partition volume.
    pub fn charge(&self) -> usize {
        self.key.len() + self.value.len() + ENTRY_OVERHEAD
    }

    pub fn charge_for(key_len: usize, value_len: usize) -> usize {
        key_len + value_len + ENTRY_OVERHEAD
    }

    pub(crate) fn mark_used(&self) {
        self.used.store(true, Ordering::Relaxed);
    }

    pub(crate) fn test_and_clear_used(&self) -> bool {
        self.used.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn clock_pos(&self) -> u32 {
        self.clock_pos.load(Ordering::Relaxed)
    }

    pub(crate) fn set_clock_pos(&self, pos: u32) {
        self.clock_pos.store(pos, Ordering::Relaxed);
    }

    /// Parse the value as an unsigned decimal for incr/decr. Digits only;
    /// anything else, or overflow, is not a number.
    pub fn value_u64(&self) -> Option<u64> {
        if self.value.is_empty() {
            return None;
        }
        let mut acc: u64 = 0;
        for &byte in self.value.iter() {
            if !byte.is_ascii_digit() {
                return None;
            }
            acc = acc
                .checked_mul(10)?
                .checked_add((byte - b'0') as u64)?;
        }
        Some(acc)
    }

    /// Format a counter value as its decimal representation.
    pub fn format_u64(value: u64) -> Bytes {
        let mut buf = itoa::Buffer::new();
        Bytes::copy_from_slice(buf.format(value).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: &[u8]) -> Arc<Entry> {
        Entry::new(Bytes::from_static(b"k"), Bytes::copy_from_slice(value), 0, 0)
    }

    #[test]
    fn numeric_values_parse() {
        assert_eq!(entry(b"0").value_u64(), Some(0));
        assert_eq!(entry(b"123").value_u64(), Some(123));
        assert_eq!(entry(b"0012").value_u64(), Some(12));
        assert_eq!(
            entry(b"18446744073709551615").value_u64(),
            Some(u64::MAX)
        );
    }

    #[test]
    fn non_numeric_values_rejected() {
        assert_eq!(entry(b"").value_u64(), None);
        assert_eq!(entry(b"abc").value_u64(), None);
        assert_eq!(entry(b"12x").value_u64(), None);
        assert_eq!(entry(b" 1").value_u64(), None);
        // One past u64::MAX overflows.
        assert_eq!(entry(b"18446744073709551616").value_u64(), None);
    }

    #[test]
    fn format_round_trips() {
        for v in [0u64, 1, 9, 10, 12345, u64::MAX] {
            let formatted = Entry::format_u64(v);
            let e = Entry::new(Bytes::from_static(b"k"), formatted, 0, 0);
            assert_eq!(e.value_u64(), Some(v));
        }
    }

    #[test]
    fn charge_includes_overhead() {
        let e = entry(b"hello");
        assert_eq!(e.charge(), 1 + 5 + ENTRY_OVERHEAD);
        assert_eq!(Entry::charge_for(1, 5), e.charge());
    }

    #[test]
    fn used_bit_is_second_chance() {
        let e = entry(b"v");
        assert!(!e.test_and_clear_used());
        e.mark_used();
        assert!(e.test_and_clear_used());
        assert!(!e.test_and_clear_used());
    }
}
