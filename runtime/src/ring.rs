//! Bounded lock-free ring buffers for cross-core messaging.
//!
//! Two shapes are provided:
//!
//! * [`SpscRing`] — a FastForward-style single-producer single-consumer ring
//!   of machine words. An empty slot holds zero, so a put publishes the
//!   payload with release ordering and a get observes it with acquire
//!   ordering before clearing the slot. The producer end can optionally be
//!   shared by taking the ring's put lock (the per-core sched/inbox/chunks
//!   rings are written by many cores but always drained by exactly one).
//!
//! * [`MpmcRing`] — a multi-producer multi-consumer ring where every slot
//!   carries a sequence `lock` word (Giacomoni/Scogland variant). Producers
//!   CAS the tail, publish data, then store `tail + 1` into the slot lock;
//!   consumers CAS the head, read, then store `head + capacity`. Busy-wait
//!   enqueue/dequeue with exponential backoff serve "must succeed" sites.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::spin::{Backoff, SpinLock};

/// A word stored in a ring. Zero is reserved as the empty-slot sentinel for
/// [`SpscRing`], so payloads are non-zero by construction (box pointers, or
/// small integers biased by one at the call site).
pub type Word = usize;

/// Single-producer single-consumer bounded ring of non-zero words.
pub struct SpscRing {
    slots: Box<[AtomicUsize]>,
    mask: usize,
    /// Consumer cursor; touched only by the owning core.
    head: CachePadded<AtomicUsize>,
    /// Producer cursor; touched under `put_lock` when the producer end is
    /// shared.
    tail: CachePadded<AtomicUsize>,
    put_lock: SpinLock,
}

impl SpscRing {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| AtomicUsize::new(0)).collect();
        SpscRing {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            put_lock: SpinLock::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Single-producer put. Fails (returning the word back) when the ring is
    /// full.
    pub fn put(&self, word: Word) -> Result<(), Word> {
        debug_assert!(word != 0);
        let tail = self.tail.load(Ordering::Relaxed);
        let slot = &self.slots[tail & self.mask];
        if slot.load(Ordering::Acquire) != 0 {
            return Err(word);
        }
        slot.store(word, Ordering::Release);
        self.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
        Ok(())
    }

    /// Multi-producer put: serializes producers on the ring's put lock.
    pub fn locked_put(&self, word: Word) -> Result<(), Word> {
        self.put_lock.lock();
        let result = self.put(word);
        self.put_lock.unlock();
        result
    }

    /// Single-consumer get; only the owning core may call this.
    pub fn get(&self) -> Option<Word> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        let word = slot.load(Ordering::Acquire);
        if word == 0 {
            return None;
        }
        slot.store(0, Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Relaxed);
        Some(word)
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        self.slots[head & self.mask].load(Ordering::Acquire) == 0
    }
}

// Payload words are plain values; the ring itself is safe to share.
unsafe impl Send for SpscRing {}
unsafe impl Sync for SpscRing {}

struct Node {
    lock: AtomicUsize,
    data: AtomicUsize,
}

/// Multi-producer multi-consumer bounded ring of words.
pub struct MpmcRing {
    nodes: Box<[Node]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

impl MpmcRing {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let nodes = (0..capacity)
            .map(|i| Node {
                lock: AtomicUsize::new(i),
                data: AtomicUsize::new(0),
            })
            .collect();
        MpmcRing {
            nodes,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Non-blocking enqueue. Fails when the ring is full or the tail is
    /// contended; callers retry or fall back to [`MpmcRing::enqueue`].
    pub fn put(&self, data: Word) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let node = &self.nodes[tail & self.mask];
        if node.lock.load(Ordering::Acquire) != tail {
            return false;
        }
        if self
            .tail
            .compare_exchange(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        node.data.store(data, Ordering::Relaxed);
        node.lock.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Non-blocking dequeue.
    pub fn get(&self) -> Option<Word> {
        let head = self.head.load(Ordering::Relaxed);
        let node = &self.nodes[head & self.mask];
        if node.lock.load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }
        if self
            .head
            .compare_exchange(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let data = node.data.load(Ordering::Relaxed);
        node.lock
            .store(head.wrapping_add(self.capacity()), Ordering::Release);
        Some(data)
    }

    /// Enqueue that must succeed: claims a slot with fetch-add and busy-waits
    /// with exponential backoff until the slot turn comes around.
    pub fn enqueue(&self, data: Word) {
        let tail = self.tail.fetch_add(1, Ordering::Relaxed);
        let node = &self.nodes[tail & self.mask];
        let mut backoff = Backoff::new();
        while node.lock.load(Ordering::Acquire) != tail {
            backoff.spin();
        }
        node.data.store(data, Ordering::Relaxed);
        node.lock.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Dequeue that must succeed; the busy-wait mirror of [`enqueue`].
    ///
    /// [`enqueue`]: MpmcRing::enqueue
    pub fn dequeue(&self) -> Word {
        let head = self.head.fetch_add(1, Ordering::Relaxed);
        let node = &self.nodes[head & self.mask];
        let mut backoff = Backoff::new();
        while node.lock.load(Ordering::Acquire) != head.wrapping_add(1) {
            backoff.spin();
        }
        let data = node.data.load(Ordering::Relaxed);
        node.lock
            .store(head.wrapping_add(self.capacity()), Ordering::Release);
        data
    }
}

unsafe impl Send for MpmcRing {}
unsafe impl Sync for MpmcRing {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn spsc_put_get_roundtrip() {
        let ring = SpscRing::new(8);
        assert!(ring.is_empty());
        for i in 1..=8 {
            ring.put(i).unwrap();
        }
        // Full: the ninth put must fail and hand the word back.
        assert_eq!(ring.put(9), Err(9));
        for i in 1..=8 {
            assert_eq!(ring.get(), Some(i));
        }
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn spsc_wraps_around() {
        let ring = SpscRing::new(4);
        for round in 0..100usize {
            ring.put(round * 2 + 1).unwrap();
            assert_eq!(ring.get(), Some(round * 2 + 1));
        }
    }

    #[test]
    fn spsc_cross_thread_fifo() {
        let ring = Arc::new(SpscRing::new(64));
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 1..=10_000usize {
                    let mut backoff = Backoff::new();
                    while ring.put(i).is_err() {
                        backoff.spin();
                    }
                }
            })
        };
        let mut expected = 1usize;
        let mut backoff = Backoff::new();
        while expected <= 10_000 {
            match ring.get() {
                Some(word) => {
                    assert_eq!(word, expected);
                    expected += 1;
                }
                None => backoff.spin(),
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn spsc_locked_put_many_producers() {
        let ring = Arc::new(SpscRing::new(1024));
        let mut handles = Vec::new();
        for p in 0..4usize {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..250usize {
                    let word = p * 1000 + i + 1;
                    let mut backoff = Backoff::new();
                    while ring.locked_put(word).is_err() {
                        backoff.spin();
                    }
                }
            }));
        }
        let mut seen = HashSet::new();
        while seen.len() < 1000 {
            if let Some(word) = ring.get() {
                assert!(seen.insert(word), "duplicate word {word}");
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn mpmc_put_get_roundtrip() {
        let ring = MpmcRing::new(4);
        assert!(ring.put(11));
        assert!(ring.put(22));
        assert_eq!(ring.get(), Some(11));
        assert_eq!(ring.get(), Some(22));
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn mpmc_put_fails_when_full() {
        let ring = MpmcRing::new(2);
        assert!(ring.put(1));
        assert!(ring.put(2));
        assert!(!ring.put(3));
        assert_eq!(ring.get(), Some(1));
        assert!(ring.put(3));
    }

    #[test]
    fn mpmc_concurrent_transfer_no_loss_no_dup() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;

        let ring = Arc::new(MpmcRing::new(256));
        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let ring = ring.clone();
            producers.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    ring.enqueue(p * PER_PRODUCER + i + 1);
                }
            }));
        }
        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let ring = ring.clone();
            consumers.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..(PRODUCERS * PER_PRODUCER / CONSUMERS) {
                    got.push(ring.dequeue());
                }
                got
            }));
        }
        for h in producers {
            h.join().unwrap();
        }
        let mut all = HashSet::new();
        for h in consumers {
            for word in h.join().unwrap() {
                assert!(all.insert(word), "duplicate word {word}");
            }
        }
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        for p in 0..PRODUCERS {
            for i in 0..PER_PRODUCER {
                assert!(all.contains(&(p * PER_PRODUCER + i + 1)));
            }
        }
    }

    #[test]
    fn mpmc_per_producer_fifo() {
        // One producer, one consumer through the non-blocking API: order is
        // preserved for successful operations.
        let ring = Arc::new(MpmcRing::new(16));
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 1..=2_000usize {
                    let mut backoff = Backoff::new();
                    while !ring.put(i) {
                        backoff.spin();
                    }
                }
            })
        };
        let mut expected = 1usize;
        let mut backoff = Backoff::new();
        while expected <= 2_000 {
            match ring.get() {
                Some(word) => {
                    assert_eq!(word, expected);
                    expected += 1;
                }
                None => backoff.spin(),
            }
        }
        producer.join().unwrap();
    }
}
