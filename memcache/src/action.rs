//! Partition actions and their serialization strategies.
//!
//! Every table operation is phrased as an action descriptor applied to one
//! partition. Three strategies make application safe, picked at startup:
//!
//! * **Locking** — the caller takes the partition's task lock, spinning
//!   with task yields, then applies the action inline.
//! * **Delegate** — the action is shipped to the partition's owning core
//!   through its inbox ring; the caller blocks on a future and receives
//!   the action back with its outputs filled in.
//! * **Combine** — the action is enqueued on the partition's combiner; one
//!   contender wins and applies a batch of queued actions while the rest
//!   spin on their per-action done flags.
//!
//! After any mutating action the caller kicks maintenance: a stride routine
//! when the partition outgrew its buckets, an eviction routine when it
//! outgrew its volume. Both run as posted work and yield between steps.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use mm_runtime::future::{future, FutureValue};
use mm_runtime::task;
use mm_runtime::{submit_to, Core, Work};

use crate::entry::Entry;
use crate::metrics::{EVICTIONS, EXPANSIONS};
use crate::table::{AccessMode, PartData, Partition, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOp {
    /// Set `old_entry` to the matching entry (referenced) or none.
    Lookup,
    /// Drop a previously returned reference.
    Finish,
    /// Unlink the matching entry; `old_entry` reports what was removed.
    Delete,
    /// Admission check for a new entry of the given size.
    Create,
    /// Abandon a created-but-uninserted entry.
    Cancel,
    /// Link `new_entry`; assumes no existing match.
    Insert,
    /// Replace the existing entry, optionally only on a stamp match.
    Update,
    /// Insert or replace.
    Upsert,
    /// One incremental expansion step.
    Stride,
    /// One clock-hand eviction step.
    Evict,
    /// Unlink everything.
    Flush,
}

/// Outputs written by whoever applies the action.
#[derive(Default)]
pub struct ActionOut {
    pub old_entry: Option<Arc<Entry>>,
    pub entry_match: bool,
    pub evicted: bool,
}

pub struct McAction {
    pub op: ActionOp,
    pub key: Bytes,
    pub hash: u32,
    pub part: u16,
    pub new_entry: Option<Arc<Entry>>,
    /// Stamp to compare under `match_stamp`.
    pub stamp: u64,
    pub match_stamp: bool,
    /// Keep a reference to the existing entry when a stamp match fails.
    /// The original's companion flag retaining the new entry on success
    /// has no counterpart here: the caller's own clone survives insertion.
    pub ref_old_on_failure: bool,
    /// Admission size for `Create`.
    pub charge: usize,
    out: UnsafeCell<ActionOut>,
    done: AtomicBool,
    /// Set on the combine path so the winning contender can reach the
    /// table; null otherwise.
    table: *const Table,
}

// Safety: the action crosses threads in exactly two ways — boxed into a
// delegate work item, or by pointer through the combiner ring. In both the
// single applier has exclusive access to `out` (synchronized by the future
// or the `done` flag with acquire/release ordering), inputs are read-only,
// and `table` is only dereferenced while the requester keeps the table
// alive and spins.
unsafe impl Send for McAction {}
unsafe impl Sync for McAction {}

impl McAction {
    pub fn new(op: ActionOp, key: Bytes, hash: u32, part: u16) -> McAction {
        McAction {
            op,
            key,
            hash,
            part,
            new_entry: None,
            stamp: 0,
            match_stamp: false,
            ref_old_on_failure: false,
            charge: 0,
            out: UnsafeCell::new(ActionOut::default()),
            done: AtomicBool::new(false),
            table: std::ptr::null(),
        }
    }

    pub fn for_part(op: ActionOp, part: u16) -> McAction {
        McAction::new(op, Bytes::new(), 0, part)
    }

    /// Take the output block after the action completed.
    fn into_out(self) -> ActionOut {
        self.out.into_inner()
    }
}

/// Combiner routine: applies one queued action on behalf of its requester.
pub(crate) fn combine_perform(word: usize) {
    // Safety: words on a partition's combiner ring are pointers to live
    // actions whose requesters spin until `done` is set below, and whose
    // `table` pointers they keep alive.
    let action = unsafe { &*(word as *const McAction) };
    let table = unsafe { &*action.table };
    let part = &table.parts[action.part as usize];
    {
        let mut data = part.data.lock();
        apply(&mut data, part, action);
    }
    action.done.store(true, Ordering::Release);
}

/// Apply an action to partition state. The caller holds the partition's
/// serialization.
fn apply(data: &mut PartData, part: &Partition, action: &McAction) {
    // Safety: exclusive access to `out` is part of the serialization
    // contract described on the Send/Sync impl.
    let out = unsafe { &mut *action.out.get() };
    match action.op {
        ActionOp::Lookup => {
            out.old_entry = data.lookup(&action.key, action.hash);
        }
        ActionOp::Finish => {
            out.old_entry = None;
        }
        ActionOp::Delete => {
            out.old_entry = data.remove(&action.key, action.hash);
        }
        ActionOp::Create => {
            out.entry_match = action.charge <= part.volume_max;
        }
        ActionOp::Cancel => {}
        ActionOp::Insert => {
            // Inserting over an existing match would leave a ghost entry in
            // the chain, so the absence check rides the same serialization.
            if data.find(&action.key, action.hash).is_some() {
                out.entry_match = false;
            } else {
                let entry = action
                    .new_entry
                    .clone()
                    .expect("insert action without an entry");
                data.insert(entry, action.hash);
                out.entry_match = true;
            }
        }
        ActionOp::Update => {
            match data.find(&action.key, action.hash) {
                Some(existing) => {
                    if action.match_stamp && existing.stamp() != action.stamp {
                        out.entry_match = false;
                        out.old_entry = if action.ref_old_on_failure {
                            Some(existing)
                        } else {
                            None
                        };
                    } else {
                        let old = data.remove(&action.key, action.hash);
                        debug_assert!(old.is_some());
                        let entry = action
                            .new_entry
                            .clone()
                            .expect("update action without an entry");
                        data.insert(entry, action.hash);
                        out.entry_match = true;
                        out.old_entry = None;
                    }
                }
                None => {
                    out.entry_match = false;
                    out.old_entry = None;
                }
            }
        }
        ActionOp::Upsert => {
            out.old_entry = data.remove(&action.key, action.hash);
            let entry = action
                .new_entry
                .clone()
                .expect("upsert action without an entry");
            data.insert(entry, action.hash);
        }
        ActionOp::Stride => {
            data.stride(part.nbuckets_max);
            EXPANSIONS.increment();
        }
        ActionOp::Evict => {
            out.old_entry = data.evict_one();
            out.evicted = out.old_entry.is_some();
        }
        ActionOp::Flush => {
            data.flush();
        }
    }
}

impl Table {
    /// Run an action under the configured strategy. `None` only when the
    /// runtime is shutting down underneath a delegated action.
    pub(crate) async fn run_action(self: &Arc<Self>, action: McAction) -> Option<ActionOut> {
        match self.mode {
            AccessMode::Locking => {
                let part = &self.parts[action.part as usize];
                loop {
                    match part.data.try_lock() {
                        Some(mut data) => {
                            apply(&mut data, part, &action);
                            break;
                        }
                        None => task::yield_now().await,
                    }
                }
                Some(action.into_out())
            }
            AccessMode::Delegate => {
                let part = &self.parts[action.part as usize];
                let owner = part.owner;
                let here = Core::try_current().map(|core| core.id());
                if here == Some(owner) || here.is_none() {
                    let mut data = part.data.lock();
                    apply(&mut data, part, &action);
                    drop(data);
                    return Some(action.into_out());
                }
                let (promise, value): (_, FutureValue<McAction>) = future();
                let table = self.clone();
                let rt = Core::current().runtime().clone();
                submit_to(
                    rt,
                    owner,
                    Work::new(move || async move {
                        let part = &table.parts[action.part as usize];
                        {
                            let mut data = part.data.lock();
                            apply(&mut data, part, &action);
                        }
                        promise.set(action);
                    }),
                )
                .await;
                match value.await {
                    Ok(action) => Some(action.into_out()),
                    Err(_) => None,
                }
            }
            AccessMode::Combine => {
                let mut action = action;
                action.table = Arc::as_ptr(self);
                let part = &self.parts[action.part as usize];
                let combiner = part
                    .combiner
                    .as_ref()
                    .expect("combine mode without a combiner");
                combiner.execute(&action as *const McAction as usize, || {
                    action.done.load(Ordering::Acquire)
                });
                Some(action.into_out())
            }
        }
    }

    // ------------------------------------------------------------------
    // Operation wrappers used by the command processors.
    // ------------------------------------------------------------------

    pub async fn lookup(self: &Arc<Self>, key: &Bytes) -> Option<Arc<Entry>> {
        let hash = Self::hash(key);
        let action = McAction::new(ActionOp::Lookup, key.clone(), hash, self.part_of(hash));
        self.run_action(action).await?.old_entry
    }

    /// Release a reference obtained from a lookup. With refcounted entries
    /// the drop itself is the unref; the action exists so the release is
    /// ordered with the partition like any other operation.
    pub async fn finish(self: &Arc<Self>, entry: Arc<Entry>) {
        let key = Bytes::copy_from_slice(entry.key());
        let hash = Self::hash(&key);
        let mut action = McAction::new(ActionOp::Finish, key, hash, self.part_of(hash));
        action.new_entry = Some(entry);
        let _ = self.run_action(action).await;
    }

    pub async fn delete(self: &Arc<Self>, key: &Bytes) -> Option<Arc<Entry>> {
        let hash = Self::hash(key);
        let action = McAction::new(ActionOp::Delete, key.clone(), hash, self.part_of(hash));
        self.run_action(action).await?.old_entry
    }

    /// Admission check for a new entry. False means the entry can never
    /// fit, a resource error surfaced to the client.
    pub async fn create(self: &Arc<Self>, key: &Bytes, value_len: usize) -> bool {
        let hash = Self::hash(key);
        let mut action = McAction::new(ActionOp::Create, key.clone(), hash, self.part_of(hash));
        action.charge = Entry::charge_for(key.len(), value_len);
        match self.run_action(action).await {
            Some(out) => out.entry_match,
            None => false,
        }
    }

    /// Abandon a created-but-uninserted entry.
    pub async fn cancel(self: &Arc<Self>, entry: Arc<Entry>) {
        let key = Bytes::copy_from_slice(entry.key());
        let hash = Self::hash(&key);
        let mut action = McAction::new(ActionOp::Cancel, key, hash, self.part_of(hash));
        action.new_entry = Some(entry);
        let _ = self.run_action(action).await;
    }

    /// Link a new entry if no match exists; false reports a loser.
    pub async fn insert(self: &Arc<Self>, key: &Bytes, entry: Arc<Entry>) -> bool {
        let hash = Self::hash(key);
        let mut action = McAction::new(ActionOp::Insert, key.clone(), hash, self.part_of(hash));
        action.new_entry = Some(entry);
        let part = action.part;
        let out = self.run_action(action).await;
        self.maintain(part);
        out.map(|out| out.entry_match).unwrap_or(false)
    }

    /// Replace the existing entry. With `match_stamp`, only when the stored
    /// stamp equals `stamp`; on a failed match the existing entry comes
    /// back so the caller can tell a miss from a conflict.
    pub async fn update(
        self: &Arc<Self>,
        key: &Bytes,
        entry: Arc<Entry>,
        match_stamp: Option<u64>,
    ) -> (bool, Option<Arc<Entry>>) {
        let hash = Self::hash(key);
        let mut action = McAction::new(ActionOp::Update, key.clone(), hash, self.part_of(hash));
        action.new_entry = Some(entry);
        if let Some(stamp) = match_stamp {
            action.match_stamp = true;
            action.stamp = stamp;
            action.ref_old_on_failure = true;
        }
        let part = action.part;
        let out = self.run_action(action).await;
        self.maintain(part);
        match out {
            Some(out) => (out.entry_match, out.old_entry),
            None => (false, None),
        }
    }

    /// Insert or replace; the displaced entry (if any) is returned and
    /// usually just dropped.
    pub async fn upsert(self: &Arc<Self>, key: &Bytes, entry: Arc<Entry>) -> Option<Arc<Entry>> {
        let hash = Self::hash(key);
        let mut action = McAction::new(ActionOp::Upsert, key.clone(), hash, self.part_of(hash));
        action.new_entry = Some(entry);
        let part = action.part;
        let out = self.run_action(action).await;
        self.maintain(part);
        out.and_then(|out| out.old_entry)
    }

    pub async fn stride_step(self: &Arc<Self>, part: u16) {
        let _ = self
            .run_action(McAction::for_part(ActionOp::Stride, part))
            .await;
    }

    pub async fn evict_step(self: &Arc<Self>, part: u16) -> bool {
        match self
            .run_action(McAction::for_part(ActionOp::Evict, part))
            .await
        {
            Some(out) => out.evicted,
            None => false,
        }
    }

    pub async fn flush_part(self: &Arc<Self>, part: u16) {
        let _ = self
            .run_action(McAction::for_part(ActionOp::Flush, part))
            .await;
    }

    pub async fn flush_all(self: &Arc<Self>) {
        for index in 0..self.parts.len() as u16 {
            self.flush_part(index).await;
        }
    }

    // ------------------------------------------------------------------
    // Background maintenance.
    // ------------------------------------------------------------------

    /// Kick the stride and eviction routines when the partition needs them.
    fn maintain(self: &Arc<Self>, part_index: u16) {
        let part = &self.parts[part_index as usize];

        if part.needs_stride() && !part.striding.swap(true, Ordering::AcqRel) {
            self.spawn_maintenance(part_index, MaintenanceKind::Stride);
        }
        if part.over_volume(0) && !part.evicting.swap(true, Ordering::AcqRel) {
            self.spawn_maintenance(part_index, MaintenanceKind::Evict);
        }
    }

    fn spawn_maintenance(self: &Arc<Self>, part_index: u16, kind: MaintenanceKind) {
        let core = match Core::try_current() {
            Some(core) => core,
            None => {
                // Off-core callers (tests, startup) run maintenance in
                // place to completion.
                self.maintain_inline(part_index, kind);
                return;
            }
        };
        let part = &self.parts[part_index as usize];
        let target = match self.mode {
            AccessMode::Delegate => part.owner,
            _ => core.id(),
        };
        let table = self.clone();
        let work = Work::new(move || async move {
            match kind {
                MaintenanceKind::Stride => stride_routine(table, part_index).await,
                MaintenanceKind::Evict => evict_routine(table, part_index).await,
            }
        });
        if target == core.id() {
            core.post_local(work);
        } else {
            let rt = core.runtime().clone();
            rt.submit(target, work);
        }
    }

    fn maintain_inline(self: &Arc<Self>, part_index: u16, kind: MaintenanceKind) {
        let part = &self.parts[part_index as usize];
        match kind {
            MaintenanceKind::Stride => {
                loop {
                    {
                        let mut data = part.data.lock();
                        data.stride(part.nbuckets_max);
                        EXPANSIONS.increment();
                    }
                    if !part.needs_stride() {
                        break;
                    }
                }
                part.striding.store(false, Ordering::Release);
            }
            MaintenanceKind::Evict => {
                while part.over_volume(part.volume_reserve) {
                    let evicted = part.data.lock().evict_one();
                    match evicted {
                        Some(_) => { EVICTIONS.increment(); }
                        None => break,
                    }
                }
                part.evicting.store(false, Ordering::Release);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum MaintenanceKind {
    Stride,
    Evict,
}

/// Background expansion: one stride step per scheduling turn until the
/// partition no longer qualifies.
async fn stride_routine(table: Arc<Table>, part_index: u16) {
    loop {
        table.stride_step(part_index).await;
        if !table.parts[part_index as usize].needs_stride() {
            break;
        }
        task::yield_now().await;
    }
    table.parts[part_index as usize]
        .striding
        .store(false, Ordering::Release);
    tracing::debug!(part = part_index, "stride round finished");
}

/// Background eviction: advance the clock hand until the volume drops below
/// the high-water mark less the reserve.
async fn evict_routine(table: Arc<Table>, part_index: u16) {
    loop {
        let part = &table.parts[part_index as usize];
        if !part.over_volume(part.volume_reserve) {
            break;
        }
        if !table.evict_step(part_index).await {
            break;
        }
        EVICTIONS.increment();
        task::yield_now().await;
    }
    table.parts[part_index as usize]
        .evicting
        .store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::CacheConfig;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        // The Locking strategy never parks off-core: yields re-wake
        // immediately, so polling in a loop terminates.
        use std::sync::atomic::AtomicUsize;
        use std::task::{Context, Poll, Wake, Waker};

        struct Noop(AtomicUsize);
        impl Wake for Noop {
            fn wake(self: Arc<Self>) {}
        }

        let waker = Waker::from(Arc::new(Noop(AtomicUsize::new(0))));
        let mut cx = Context::from_waker(&waker);
        let mut future = Box::pin(future);
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(value) => return value,
                Poll::Pending => std::thread::yield_now(),
            }
        }
    }

    fn test_table(mode: AccessMode) -> Arc<Table> {
        Table::new(&CacheConfig {
            nparts: 2,
            volume: 1 << 20,
            nbuckets_min: 8,
            mode,
            ncores: 1,
        })
    }

    fn kv(key: &[u8], value: &[u8]) -> (Bytes, Arc<Entry>) {
        let key = Bytes::copy_from_slice(key);
        let entry = Entry::new(key.clone(), Bytes::copy_from_slice(value), 0, 0);
        (key, entry)
    }

    #[test]
    fn upsert_then_lookup() {
        let table = test_table(AccessMode::Locking);
        block_on(async {
            let (key, entry) = kv(b"foo", b"bar");
            assert!(table.upsert(&key, entry).await.is_none());
            let hit = table.lookup(&key).await.unwrap();
            assert_eq!(hit.value(), b"bar");

            let (_, replacement) = kv(b"foo", b"baz");
            let old = table.upsert(&key, replacement).await.unwrap();
            assert_eq!(old.value(), b"bar");
            assert_eq!(table.lookup(&key).await.unwrap().value(), b"baz");
        });
    }

    #[test]
    fn delete_is_idempotent() {
        let table = test_table(AccessMode::Locking);
        block_on(async {
            let (key, entry) = kv(b"k", b"v");
            table.insert(&key, entry).await;
            assert!(table.delete(&key).await.is_some());
            assert!(table.delete(&key).await.is_none());
        });
    }

    #[test]
    fn update_with_stamp_match() {
        let table = test_table(AccessMode::Locking);
        block_on(async {
            let (key, entry) = kv(b"k", b"a");
            table.insert(&key, entry).await;
            let current = table.lookup(&key).await.unwrap();
            let stamp = current.stamp();
            assert!(stamp > 0);

            // Wrong stamp: rejected, existing entry reported back.
            let (_, contender) = kv(b"k", b"b");
            let (matched, old) = table.update(&key, contender, Some(stamp + 1)).await;
            assert!(!matched);
            assert!(old.is_some());
            assert_eq!(table.lookup(&key).await.unwrap().value(), b"a");

            // Right stamp: replaced, and the new stamp grew.
            let (_, winner) = kv(b"k", b"b");
            let (matched, _) = table.update(&key, winner, Some(stamp)).await;
            assert!(matched);
            let replaced = table.lookup(&key).await.unwrap();
            assert_eq!(replaced.value(), b"b");
            assert!(replaced.stamp() > stamp);
        });
    }

    #[test]
    fn update_on_missing_key_reports_miss() {
        let table = test_table(AccessMode::Locking);
        block_on(async {
            let (key, entry) = kv(b"ghost", b"v");
            let (matched, old) = table.update(&key, entry, Some(1)).await;
            assert!(!matched);
            assert!(old.is_none());
        });
    }

    #[test]
    fn create_admission_checks_volume() {
        let table = test_table(AccessMode::Locking);
        block_on(async {
            let key = Bytes::from_static(b"k");
            assert!(table.create(&key, 10).await);
            // Larger than a whole partition can ever hold.
            assert!(!table.create(&key, 10 << 20).await);
        });
    }

    #[test]
    fn create_cancel_and_finish_release_references() {
        let table = test_table(AccessMode::Locking);
        block_on(async {
            let (key, entry) = kv(b"k", b"v");
            assert!(table.create(&key, 1).await);
            // Created but never linked: cancel frees the only reference.
            table.cancel(entry).await;
            assert!(table.lookup(&key).await.is_none());

            let (_, entry) = kv(b"k", b"v");
            assert!(table.insert(&key, entry).await);
            let held = table.lookup(&key).await.unwrap();
            table.finish(held).await;
            // The table's own reference is the only one left.
            assert!(table.lookup(&key).await.is_some());
        });
    }

    #[test]
    fn combine_mode_round_trip() {
        let table = test_table(AccessMode::Combine);
        block_on(async {
            let (key, entry) = kv(b"foo", b"bar");
            assert!(table.upsert(&key, entry).await.is_none());
            assert_eq!(table.lookup(&key).await.unwrap().value(), b"bar");
            assert!(table.delete(&key).await.is_some());
        });
    }

    #[test]
    fn inline_maintenance_strides_under_load() {
        let table = test_table(AccessMode::Locking);
        block_on(async {
            for i in 0..2_000u32 {
                let (key, entry) = kv(format!("key-{i}").as_bytes(), b"v");
                table.insert(&key, entry).await;
            }
            // Off-core maintenance ran inline, so the partitions are grown.
            for part in 0..2 {
                let (nentries, used, _) = table.partition(part).occupancy();
                assert!(nentries <= used * 2, "partition {part} still overfull");
            }
            for i in (0..2_000u32).step_by(13) {
                let key = Bytes::copy_from_slice(format!("key-{i}").as_bytes());
                assert!(table.lookup(&key).await.is_some(), "lost key-{i}");
            }
        });
    }

    #[test]
    fn inline_maintenance_evicts_over_volume() {
        let table = Table::new(&CacheConfig {
            nparts: 1,
            volume: 8 * 1024,
            nbuckets_min: 8,
            mode: AccessMode::Locking,
            ncores: 1,
        });
        block_on(async {
            for i in 0..200u32 {
                let (key, entry) = kv(format!("key-{i}").as_bytes(), &[0u8; 100]);
                table.upsert(&key, entry).await;
            }
            let part = table.partition(0);
            let (_, _, volume) = part.occupancy();
            assert!(
                volume <= part.volume_max,
                "volume {volume} above limit after eviction"
            );
            assert!(table.len() < 200);
        });
    }
}
