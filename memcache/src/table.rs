//! The partitioned hash table.
//!
//! Keys hash with 32-bit FNV-1a. The low `part_bits` of the hash select the
//! partition; the remaining high bits place the key inside the partition,
//! so the two decisions never share bits. Each partition owns a
//! power-of-two bucket array that expands in place: when the entry count
//! outgrows the active buckets, a background routine re-bucketizes
//! [`STRIDE`] buckets at a time under the doubled mask, advancing the
//! `used` watermark. A key whose full-mask index lies at or past the
//! watermark falls back to the half mask, so lookups stay exact at every
//! point of the expansion.
//!
//! Entries are kept in a clock list in insertion order; when the partition
//! volume passes its limit, an eviction routine walks the hand, granting a
//! second chance to entries used since the last sweep and unlinking the
//! rest.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;

use mm_runtime::{Combiner, CoreId};

use crate::action::combine_perform;
use crate::entry::Entry;

/// Buckets re-bucketized per stride step.
pub const STRIDE: u32 = 64;

/// Eviction headroom, split across partitions.
const VOLUME_RESERVE: usize = 64 * 1024;

const COMBINER_RING_SIZE: usize = 64;
const COMBINER_HANDOFF: usize = 16;

/// Partition-access serialization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Callers take a per-partition task spinlock.
    Locking,
    /// Actions are shipped to the partition's owning core.
    Delegate,
    /// One contender executes batches on behalf of the others.
    Combine,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Partition count; rounded down to a power of two.
    pub nparts: u16,
    /// Total data volume in bytes, divided across partitions.
    pub volume: usize,
    /// Initial (and minimum) bucket count per partition; power of two.
    pub nbuckets_min: u32,
    pub mode: AccessMode,
    /// Core count, for assigning partition owners under delegation.
    pub ncores: u16,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            nparts: 1,
            volume: 64 * 1024 * 1024,
            nbuckets_min: 2048,
            mode: AccessMode::Locking,
            ncores: 1,
        }
    }
}

/// Per-partition mutable state, guarded by the partition's serialization
/// strategy.
pub(crate) struct PartData {
    pub(crate) buckets: Vec<Vec<Arc<Entry>>>,
    /// Active-prefix watermark; buckets at or past it are not yet split.
    pub(crate) used: u32,
    pub(crate) mask: u32,
    /// Bits to shift off a hash before bucket placement.
    hash_shift: u32,
    pub(crate) nentries: u32,
    pub(crate) volume: usize,
    clock: Vec<Arc<Entry>>,
    hand: u32,
    stamp: u64,
    stamp_step: u64,
}

impl PartData {
    fn bucket_index(&self, hash: u32) -> usize {
        let hb = hash >> self.hash_shift;
        let mut index = hb & self.mask;
        if index >= self.used {
            index = hb & (self.mask >> 1);
        }
        index as usize
    }

    pub(crate) fn lookup(&mut self, key: &[u8], hash: u32) -> Option<Arc<Entry>> {
        let index = self.bucket_index(hash);
        for entry in &self.buckets[index] {
            if entry.key() == key {
                entry.mark_used();
                return Some(entry.clone());
            }
        }
        None
    }

    /// Find without touching the used bit; CAS checks go through this.
    pub(crate) fn find(&self, key: &[u8], hash: u32) -> Option<Arc<Entry>> {
        let index = self.bucket_index(hash);
        self.buckets[index]
            .iter()
            .find(|entry| entry.key() == key)
            .cloned()
    }

    pub(crate) fn remove(&mut self, key: &[u8], hash: u32) -> Option<Arc<Entry>> {
        let index = self.bucket_index(hash);
        let pos = self.buckets[index]
            .iter()
            .position(|entry| entry.key() == key)?;
        let entry = self.buckets[index].swap_remove(pos);
        self.unlink_clock(&entry);
        self.nentries -= 1;
        self.volume -= entry.charge();
        Some(entry)
    }

    pub(crate) fn insert(&mut self, entry: Arc<Entry>, hash: u32) {
        self.stamp += self.stamp_step;
        entry.set_stamp(self.stamp);
        entry.set_clock_pos(self.clock.len() as u32);
        self.clock.push(entry.clone());
        let index = self.bucket_index(hash);
        self.volume += entry.charge();
        self.nentries += 1;
        self.buckets[index].push(entry);
    }

    fn unlink_clock(&mut self, entry: &Arc<Entry>) {
        let pos = entry.clock_pos() as usize;
        debug_assert!(Arc::ptr_eq(&self.clock[pos], entry));
        self.clock.swap_remove(pos);
        if let Some(moved) = self.clock.get(pos) {
            moved.set_clock_pos(pos as u32);
        }
        if self.hand as usize >= self.clock.len() {
            self.hand = 0;
        }
    }

    /// One incremental expansion step: double the array when the watermark
    /// has caught up with it, then split the next [`STRIDE`] buckets under
    /// the full mask.
    pub(crate) fn stride(&mut self, nbuckets_max: u32) {
        let size = self.mask + 1;
        if self.used == size {
            if size >= nbuckets_max {
                return;
            }
            self.buckets.resize_with((size as usize) * 2, Vec::new);
            self.mask = size * 2 - 1;
        }
        let size = self.mask + 1;
        let half = size / 2;
        let steps = STRIDE.min(size - self.used);
        let mut source = self.used - half;
        let mut target = self.used;
        for _ in 0..steps {
            let chain = std::mem::take(&mut self.buckets[source as usize]);
            let mut source_chain = Vec::new();
            let mut target_chain = Vec::new();
            for entry in chain {
                let hb = fnv1a(entry.key()) >> self.hash_shift;
                if hb & self.mask == source {
                    source_chain.push(entry);
                } else {
                    debug_assert_eq!(hb & self.mask, target);
                    target_chain.push(entry);
                }
            }
            self.buckets[source as usize] = source_chain;
            self.buckets[target as usize] = target_chain;
            source += 1;
            target += 1;
        }
        self.used += steps;
    }

    /// One CLOCK step: advance past recently-used entries, unlink the first
    /// cold one. Returns false when the partition holds nothing evictable.
    pub(crate) fn evict_one(&mut self) -> Option<Arc<Entry>> {
        let mut scanned = 0usize;
        let limit = self.clock.len() * 2 + 1;
        loop {
            if self.clock.is_empty() {
                return None;
            }
            if self.hand as usize >= self.clock.len() {
                self.hand = 0;
            }
            let entry = self.clock[self.hand as usize].clone();
            if entry.test_and_clear_used() {
                self.hand += 1;
                scanned += 1;
                if scanned >= limit {
                    return None;
                }
                continue;
            }
            let hash = fnv1a(entry.key());
            let index = self.bucket_index(hash);
            if let Some(pos) = self.buckets[index]
                .iter()
                .position(|e| Arc::ptr_eq(e, &entry))
            {
                self.buckets[index].swap_remove(pos);
            }
            self.unlink_clock(&entry);
            self.nentries -= 1;
            self.volume -= entry.charge();
            return Some(entry);
        }
    }

    pub(crate) fn flush(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
        self.clock.clear();
        self.hand = 0;
        self.nentries = 0;
        self.volume = 0;
    }

    fn needs_stride(&self, nbuckets_max: u32) -> bool {
        self.nentries > self.used * 2 && self.used < nbuckets_max
    }
}

pub struct Partition {
    pub(crate) index: u16,
    pub(crate) owner: CoreId,
    pub(crate) data: Mutex<PartData>,
    pub(crate) combiner: Option<Combiner>,
    pub(crate) striding: AtomicBool,
    pub(crate) evicting: AtomicBool,
    pub(crate) nbuckets_max: u32,
    pub(crate) volume_max: usize,
    pub(crate) volume_reserve: usize,
}

impl Partition {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub(crate) fn needs_stride(&self) -> bool {
        let data = self.data.lock();
        data.needs_stride(self.nbuckets_max)
    }

    pub(crate) fn over_volume(&self, reserve: usize) -> bool {
        let data = self.data.lock();
        data.volume + reserve > self.volume_max
    }

    /// Diagnostics for tests and stats.
    pub fn occupancy(&self) -> (u32, u32, usize) {
        let data = self.data.lock();
        (data.nentries, data.used, data.volume)
    }
}

pub struct Table {
    pub(crate) parts: Box<[Partition]>,
    pub(crate) part_bits: u32,
    pub(crate) part_mask: u32,
    pub(crate) mode: AccessMode,
}

impl Table {
    pub fn new(config: &CacheConfig) -> Arc<Table> {
        let nparts = (config.nparts.max(1) as u32).next_power_of_two();
        let nparts = if (nparts as u16) > config.nparts.max(1) {
            nparts / 2
        } else {
            nparts
        };
        let part_bits = nparts.trailing_zeros();
        let nbuckets_min = config.nbuckets_min.max(8).next_power_of_two();

        let volume_max = (config.volume / nparts as usize).max(4096);
        let volume_reserve = (VOLUME_RESERVE / nparts as usize)
            .min(volume_max / 8)
            .max(64);
        // A liberal floor of ~84 bytes per entry bounds the bucket array.
        let nentries_max = (volume_max / (Entry::charge_for(10, 10))) as u32;
        let nbuckets_max = nentries_max
            .next_power_of_two()
            .max(nbuckets_min);

        let parts = (0..nparts as u16)
            .map(|index| Partition {
                index,
                owner: (index % config.ncores.max(1)) as CoreId,
                data: Mutex::new(PartData {
                    buckets: (0..nbuckets_min).map(|_| Vec::new()).collect(),
                    used: nbuckets_min,
                    mask: nbuckets_min - 1,
                    hash_shift: part_bits,
                    nentries: 0,
                    volume: 0,
                    clock: Vec::new(),
                    hand: 0,
                    stamp: index as u64,
                    stamp_step: nparts as u64,
                }),
                combiner: match config.mode {
                    AccessMode::Combine => Some(Combiner::new(
                        combine_perform,
                        COMBINER_RING_SIZE,
                        COMBINER_HANDOFF,
                    )),
                    _ => None,
                },
                striding: AtomicBool::new(false),
                evicting: AtomicBool::new(false),
                nbuckets_max,
                volume_max,
                volume_reserve,
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        tracing::info!(
            partitions = nparts,
            part_bits,
            volume_per_partition = volume_max,
            buckets_min = nbuckets_min,
            buckets_max = nbuckets_max,
            mode = ?config.mode,
            "cache table initialized"
        );

        Arc::new(Table {
            parts,
            part_bits,
            part_mask: nparts - 1,
            mode: config.mode,
        })
    }

    pub fn hash(key: &[u8]) -> u32 {
        fnv1a(key)
    }

    /// Partition selection uses the low hash bits.
    pub fn part_of(&self, hash: u32) -> u16 {
        (hash & self.part_mask) as u16
    }

    pub fn nparts(&self) -> usize {
        self.parts.len()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn partition(&self, index: u16) -> &Partition {
        &self.parts[index as usize]
    }

    /// Total entries across partitions; a quiescent diagnostic.
    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .map(|p| p.data.lock().nentries as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fowler/Noll/Vo hash, variant 1a, 32-bit.
pub(crate) fn fnv1a(data: &[u8]) -> u32 {
    const FNV1_32_INIT: u32 = 0x811c_9dc5;
    const FNV_32_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV1_32_INIT;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_32_PRIME);
    }
    hash
}
