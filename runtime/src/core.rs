//! Cores: one OS thread per CPU core, each running a cooperative dispatcher.
//!
//! A core owns its task slab, run queue, dead list, work queue, timer queue
//! and chunk pool; nothing of that is ever touched from another thread. The
//! cross-core face of a core is [`CoreShared`]: three bounded single-consumer
//! rings (`sched` for task wakeups, `inbox` for submitted work, `chunks` for
//! buffer chunks coming home to be reclaimed) plus a notifier that knocks a
//! sleeping core awake — the event backend's waker on the primary core, a
//! timed condition on the others.
//!
//! Every core runs two permanent tasks: the **master** (highest priority)
//! spawns worker tasks for queued work items while below the worker limit,
//! and the **dealer** (idle priority) drains the inbound rings, ticks the
//! timer queue, and parks the thread when nothing else is runnable.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use bytes::BytesMut;
use mio::Events;
use parking_lot::{Condvar, Mutex};
use slab::Slab;

use crate::clock;
use crate::event::Backend;
use crate::ring::SpscRing;
use crate::runq::RunQueue;
use crate::spin::Backoff;
use crate::task::{self, Priority, Task, TaskId, TaskState};
use crate::timeq::{TimeQ, Timer};
use crate::wait::WaitQueue;

pub type CoreId = u16;

const SCHED_RING_SIZE: usize = 1024;
const INBOX_RING_SIZE: usize = 1024;
const CHUNK_RING_SIZE: usize = 1024;

/// Size of a pooled buffer chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;
const CHUNK_POOL_MAX: usize = 256;

/// Longest the dealer sleeps before it rechecks the world.
const DEALER_TIMEOUT: Duration = Duration::from_secs(1);

/// A unit of work submitted to a core. The routine runs inside a fresh
/// worker task on the target core and may suspend.
pub struct Work {
    routine: Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()>>> + Send>,
}

impl Work {
    pub fn new<F, Fut>(routine: F) -> Work
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Work {
            routine: Box::new(move || Box::pin(routine()) as Pin<Box<dyn Future<Output = ()>>>),
        }
    }

    fn into_future(self) -> Pin<Box<dyn Future<Output = ()>>> {
        (self.routine)()
    }
}

/// Timed-condition sleeper for secondary cores.
pub struct Sleeper {
    lock: Mutex<bool>,
    cond: Condvar,
}

impl Sleeper {
    fn new() -> Sleeper {
        Sleeper {
            lock: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut notified = self.lock.lock();
        *notified = true;
        self.cond.notify_one();
    }

    fn park(&self, timeout: Duration) {
        let mut notified = self.lock.lock();
        if !*notified {
            self.cond.wait_for(&mut notified, timeout);
        }
        *notified = false;
    }
}

enum Notifier {
    /// Primary core: wake the event backend's listen call.
    Backend(Arc<Backend>),
    /// Secondary core: signal its condition.
    Sleeper(Arc<Sleeper>),
}

/// The cross-core face of a core.
pub struct CoreShared {
    id: CoreId,
    /// Tasks to be scheduled on arrival; words are `task_id + 1`.
    sched: SpscRing,
    /// Submitted work items; words are `Box<Work>` pointers.
    inbox: SpscRing,
    /// Chunks freed by other cores; words are `Box<BytesMut>` pointers.
    chunks: SpscRing,
    stop: AtomicBool,
    notifier: Notifier,
}

impl CoreShared {
    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn notify(&self) {
        match &self.notifier {
            Notifier::Backend(backend) => backend.notify(),
            Notifier::Sleeper(sleeper) => sleeper.notify(),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.notify();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Make a task on this core runnable. Spins briefly if the sched ring is
    /// momentarily full; wakeups must not be dropped.
    pub(crate) fn wake(&self, task: TaskId) {
        let word = task + 1;
        let mut backoff = Backoff::new();
        while self.sched.locked_put(word).is_err() {
            backoff.spin();
            if backoff.is_saturated() {
                // Consumer may itself be asleep with a full ring.
                self.notify();
                std::thread::yield_now();
            }
        }
        self.notify();
    }

    /// Non-blocking work submission; fails when the inbox is full.
    pub fn submit(&self, work: Work) -> Result<(), Work> {
        let boxed = Box::new(work);
        let word = Box::into_raw(boxed) as usize;
        match self.inbox.locked_put(word) {
            Ok(()) => {
                self.notify();
                Ok(())
            }
            Err(word) => {
                // Safety: the word is the pointer we just leaked above.
                let boxed = unsafe { Box::from_raw(word as *mut Work) };
                Err(*boxed)
            }
        }
    }

    /// Hand a buffer chunk back to its owning core. Dropping the chunk is
    /// acceptable when the ring is full; reclaim is an optimization.
    pub fn free_chunk(&self, chunk: BytesMut) {
        let word = Box::into_raw(Box::new(chunk)) as usize;
        if self.chunks.locked_put(word).is_err() {
            // Safety: the word is the pointer we just leaked above.
            drop(unsafe { Box::from_raw(word as *mut BytesMut) });
        }
    }
}

impl Drop for CoreShared {
    fn drop(&mut self) {
        // Reclaim any boxed payloads still sitting in the rings.
        while let Some(word) = self.inbox.get() {
            // Safety: inbox words are leaked `Box<Work>` pointers.
            drop(unsafe { Box::from_raw(word as *mut Work) });
        }
        while let Some(word) = self.chunks.get() {
            // Safety: chunk words are leaked `Box<BytesMut>` pointers.
            drop(unsafe { Box::from_raw(word as *mut BytesMut) });
        }
    }
}

/// Process-wide runtime state shared by all cores.
pub struct RuntimeShared {
    cores: Vec<Arc<CoreShared>>,
    backend: Arc<Backend>,
    exit: AtomicBool,
}

impl RuntimeShared {
    pub fn ncores(&self) -> usize {
        self.cores.len()
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn core(&self, id: CoreId) -> &Arc<CoreShared> {
        &self.cores[id as usize]
    }

    /// The process exit flag set by signal handlers and the admin channel.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Submit work from outside any core (startup, admin); spins until the
    /// target inbox accepts it.
    pub fn submit(&self, target: CoreId, work: Work) {
        let shared = self.core(target);
        let mut work = work;
        loop {
            match shared.submit(work) {
                Ok(()) => return,
                Err(back) => {
                    work = back;
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Submit work to a core from task context, yielding while the target inbox
/// is full. Work for the current core bypasses the rings.
pub async fn submit_to(rt: Arc<RuntimeShared>, target: CoreId, work: Work) {
    if let Some(core) = Core::try_current() {
        if core.id() == target {
            core.post_local(work);
            return;
        }
    }
    let shared = rt.core(target).clone();
    let mut work = work;
    loop {
        match shared.submit(work) {
            Ok(()) => return,
            Err(back) => {
                work = back;
                task::yield_now().await;
            }
        }
    }
}

enum Role {
    Primary { events: RefCell<Events> },
    Secondary { sleeper: Arc<Sleeper> },
}

/// A virtual core: the per-thread scheduler state.
pub struct Core {
    shared: Arc<CoreShared>,
    rt: Arc<RuntimeShared>,
    role: Role,

    tasks: RefCell<Slab<Rc<Task>>>,
    runq: RefCell<RunQueue>,
    dead: RefCell<Vec<TaskId>>,
    timeq: RefCell<TimeQ>,

    workq: RefCell<VecDeque<Work>>,
    pub worker_wq: WaitQueue,
    pub master_wq: WaitQueue,
    nworkers: Cell<u32>,
    nworkers_max: u32,

    chunk_pool: RefCell<Vec<BytesMut>>,

    time_us: Cell<u64>,
    real_time_us: Cell<u64>,

    teardown: Cell<bool>,
}

thread_local! {
    static CURRENT_CORE: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

impl Core {
    fn new(shared: Arc<CoreShared>, rt: Arc<RuntimeShared>, nworkers_max: u32) -> Rc<Core> {
        let role = match &shared.notifier {
            Notifier::Backend(_) => Role::Primary {
                events: RefCell::new(Events::with_capacity(1024)),
            },
            Notifier::Sleeper(sleeper) => Role::Secondary {
                sleeper: sleeper.clone(),
            },
        };
        Rc::new(Core {
            shared,
            rt,
            role,
            tasks: RefCell::new(Slab::with_capacity(64)),
            runq: RefCell::new(RunQueue::new()),
            dead: RefCell::new(Vec::new()),
            timeq: RefCell::new(TimeQ::new()),
            workq: RefCell::new(VecDeque::new()),
            worker_wq: WaitQueue::new(),
            master_wq: WaitQueue::new(),
            nworkers: Cell::new(0),
            nworkers_max,
            chunk_pool: RefCell::new(Vec::new()),
            time_us: Cell::new(0),
            real_time_us: Cell::new(0),
            teardown: Cell::new(false),
        })
    }

    /// The core bound to the calling thread. Panics off-core.
    pub fn current() -> Rc<Core> {
        Core::try_current().expect("not running on a core thread")
    }

    pub fn try_current() -> Option<Rc<Core>> {
        CURRENT_CORE.with(|cell| cell.borrow().clone())
    }

    pub fn id(&self) -> CoreId {
        self.shared.id
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.role, Role::Primary { .. })
    }

    pub fn runtime(&self) -> &Arc<RuntimeShared> {
        &self.rt
    }

    pub fn shared(&self) -> &Arc<CoreShared> {
        &self.shared
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    /// Cached monotonic time, refreshed once per dealer tick.
    pub fn now_us(&self) -> u64 {
        self.time_us.get()
    }

    pub fn real_now_us(&self) -> u64 {
        self.real_time_us.get()
    }

    fn update_time(&self) {
        self.time_us.set(clock::monotonic_us());
        self.real_time_us.set(clock::realtime_us());
    }

    // ------------------------------------------------------------------
    // Tasks.
    // ------------------------------------------------------------------

    pub fn spawn<F>(&self, name: &'static str, priority: Priority, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let mut tasks = self.tasks.borrow_mut();
        let entry = tasks.vacant_entry();
        let id = entry.key();
        let task = Task::new(id, name, priority, Box::pin(future));
        entry.insert(task);
        drop(tasks);
        self.schedule(id);
        id
    }

    /// Make a task runnable; idempotent for an already-runnable task.
    pub fn schedule(&self, id: TaskId) {
        let task = match self.tasks.borrow().get(id) {
            Some(task) => task.clone(),
            None => return,
        };
        if task.scheduled.replace(true) {
            return;
        }
        match task.state.get() {
            TaskState::Blocked | TaskState::Pending => {
                task.state.set(TaskState::Pending);
                self.runq.borrow_mut().push(id, task.priority());
            }
            TaskState::Running => {
                // Re-queued after the current poll finishes.
            }
            TaskState::Exited => {
                task.scheduled.set(false);
            }
        }
    }

    pub fn cancel_task(&self, id: TaskId) {
        if let Some(task) = self.tasks.borrow().get(id) {
            task.cancel();
        }
        self.schedule(id);
    }

    pub fn add_timer(&self, timer: Timer) {
        self.timeq.borrow_mut().insert(timer);
    }

    fn poll_task(self: &Rc<Core>, id: TaskId) {
        let task = match self.tasks.borrow().get(id) {
            Some(task) => task.clone(),
            None => return,
        };
        if task.state.get() == TaskState::Exited {
            return;
        }
        task.scheduled.set(false);
        task.state.set(TaskState::Running);

        let waker = Waker::from(Arc::new(RingWaker {
            core: self.shared.clone(),
            task: id,
        }));
        let mut cx = Context::from_waker(&waker);

        task::set_current_task(Some(task.clone()));
        let poll = {
            let mut slot = task.future.borrow_mut();
            match slot.as_mut() {
                Some(future) => future.as_mut().poll(&mut cx),
                None => Poll::Ready(()),
            }
        };
        task::set_current_task(None);

        match poll {
            Poll::Ready(()) => {
                task.state.set(TaskState::Exited);
                task.future.borrow_mut().take();
                task.run_cleanups();
                self.dead.borrow_mut().push(id);
            }
            Poll::Pending => {
                if task.scheduled.get() {
                    task.state.set(TaskState::Pending);
                    self.runq.borrow_mut().push(id, task.priority());
                } else {
                    task.state.set(TaskState::Blocked);
                }
            }
        }
    }

    fn reap_dead(&self) {
        let dead: Vec<TaskId> = self.dead.borrow_mut().drain(..).collect();
        let mut tasks = self.tasks.borrow_mut();
        for id in dead {
            if tasks.contains(id) {
                tasks.remove(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Work queue.
    // ------------------------------------------------------------------

    /// Queue work on this core and kick an idle worker (or the master).
    pub fn post_local(&self, work: Work) {
        self.workq.borrow_mut().push_back(work);
        if !self.worker_wq.signal() {
            self.master_wq.signal();
        }
    }

    pub(crate) fn take_work(&self) -> Option<Work> {
        self.workq.borrow_mut().pop_front()
    }

    pub fn nworkers(&self) -> u32 {
        self.nworkers.get()
    }

    fn spawn_worker(self: &Rc<Core>, work: Work) {
        self.nworkers.set(self.nworkers.get() + 1);
        let core = self.clone();
        self.spawn("worker", Priority::Default, worker_main(core, work));
    }

    // ------------------------------------------------------------------
    // Chunk pool.
    // ------------------------------------------------------------------

    /// Take a pooled chunk, or allocate a fresh one.
    pub fn take_chunk(&self) -> BytesMut {
        self.chunk_pool
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(CHUNK_SIZE))
    }

    /// Return a chunk to this core's pool.
    pub fn release_chunk(&self, mut chunk: BytesMut) {
        let mut pool = self.chunk_pool.borrow_mut();
        if pool.len() < CHUNK_POOL_MAX && chunk.capacity() >= CHUNK_SIZE {
            chunk.clear();
            pool.push(chunk);
        }
    }

    // ------------------------------------------------------------------
    // Inbound rings.
    // ------------------------------------------------------------------

    fn drain_sched(&self) {
        while let Some(word) = self.shared.sched.get() {
            self.schedule(word - 1);
        }
    }

    fn drain_inbox(&self) {
        let mut drained = 0usize;
        while let Some(word) = self.shared.inbox.get() {
            // Safety: inbox words are leaked `Box<Work>` pointers produced
            // by `CoreShared::submit`.
            let work = unsafe { Box::from_raw(word as *mut Work) };
            self.workq.borrow_mut().push_back(*work);
            drained += 1;
        }
        while drained > 0 && self.worker_wq.signal() {
            drained -= 1;
        }
        if drained > 0 {
            self.master_wq.signal();
        }
    }

    fn drain_chunks(&self) {
        while let Some(word) = self.shared.chunks.get() {
            // Safety: chunk words are leaked `Box<BytesMut>` pointers
            // produced by `CoreShared::free_chunk`.
            let chunk = unsafe { Box::from_raw(word as *mut BytesMut) };
            self.release_chunk(*chunk);
        }
    }

    fn timer_tick(&self) {
        self.update_time();
        self.timeq.borrow_mut().tick(self.time_us.get());
    }

    // ------------------------------------------------------------------
    // Parking.
    // ------------------------------------------------------------------

    /// Give the event backend a turn, blocking when nothing is runnable.
    /// Called from the dealer, which runs at idle priority.
    fn backend_turn(&self) {
        let runnable = !self.runq.borrow().is_empty();
        let timeout = if runnable {
            Duration::ZERO
        } else {
            let next_timer = self
                .timeq
                .borrow()
                .next_expiry_us()
                .map(|expiry| Duration::from_micros(expiry.saturating_sub(self.time_us.get())));
            next_timer.map_or(DEALER_TIMEOUT, |t| t.min(DEALER_TIMEOUT))
        };
        match &self.role {
            Role::Primary { events } => {
                let mut events = events.borrow_mut();
                if let Err(e) = self.rt.backend.listen(&mut events, Some(timeout)) {
                    tracing::error!(core = self.id(), error = %e, "event backend listen failed");
                }
            }
            Role::Secondary { sleeper } => {
                if !runnable {
                    sleeper.park(timeout);
                }
            }
        }
    }

    /// Fallback nap for the boot loop when even the dealer is gone.
    fn park_briefly(&self) {
        match &self.role {
            Role::Primary { events } => {
                let mut events = events.borrow_mut();
                let _ = self
                    .rt
                    .backend
                    .listen(&mut events, Some(Duration::from_millis(50)));
            }
            Role::Secondary { sleeper } => sleeper.park(Duration::from_millis(50)),
        }
    }

    // ------------------------------------------------------------------
    // The boot loop.
    // ------------------------------------------------------------------

    fn run(self: &Rc<Core>) {
        self.update_time();
        {
            let core = self.clone();
            self.spawn("master", Priority::Master, master_main(core));
        }
        {
            let core = self.clone();
            self.spawn("dealer", Priority::Idle, dealer_main(core));
        }

        loop {
            self.reap_dead();
            self.drain_sched();
            let next = self.runq.borrow_mut().pick();
            match next {
                Some(id) => self.poll_task(id),
                None => {
                    if self.stop_requested() {
                        if !self.teardown.replace(true) {
                            self.cancel_all();
                            continue;
                        }
                        self.drop_remaining_tasks();
                        break;
                    }
                    self.park_briefly();
                }
            }
            if self.stop_requested() && self.teardown.get() && self.tasks.borrow().is_empty() {
                break;
            }
        }
        self.reap_dead();
        tracing::debug!(core = self.id(), "core stopped");
    }

    fn cancel_all(&self) {
        let ids: Vec<TaskId> = self.tasks.borrow().iter().map(|(id, _)| id).collect();
        for id in &ids {
            if let Some(task) = self.tasks.borrow().get(*id) {
                task.cancel();
            }
        }
        for id in ids {
            self.schedule(id);
        }
        self.worker_wq.broadcast();
        self.master_wq.broadcast();
    }

    /// Tear down tasks that did not unwind cooperatively. Cleanup handlers
    /// still run; the futures are dropped in place.
    fn drop_remaining_tasks(&self) {
        let leftover: Vec<Rc<Task>> = self.tasks.borrow().iter().map(|(_, t)| t.clone()).collect();
        for task in &leftover {
            if task.state.get() != TaskState::Exited {
                tracing::debug!(core = self.id(), task = task.name(), "dropping stuck task");
                task.future.borrow_mut().take();
                task.run_cleanups();
            }
        }
        self.tasks.borrow_mut().clear();
    }
}

/// Waker routing a wakeup to the task's owning core: directly into the run
/// queue when on the same core, through the sched ring plus notifier
/// otherwise.
struct RingWaker {
    core: Arc<CoreShared>,
    task: TaskId,
}

impl Wake for RingWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(core) = Core::try_current() {
            if Arc::ptr_eq(&core.shared, &self.core) {
                core.schedule(self.task);
                return;
            }
        }
        self.core.wake(self.task);
    }
}

async fn master_main(core: Rc<Core>) {
    loop {
        if core.stop_requested() || task::is_cancelled() {
            break;
        }
        let work = if core.nworkers.get() < core.nworkers_max {
            core.take_work()
        } else {
            None
        };
        match work {
            Some(work) => {
                core.spawn_worker(work);
                task::yield_now().await;
            }
            None => core.master_wq.wait_back().await,
        }
    }
}

async fn worker_main(core: Rc<Core>, work: Work) {
    {
        let counter = core.clone();
        task::current_task()
            .push_cleanup(move || counter.nworkers.set(counter.nworkers.get() - 1));
    }
    let mut work = work;
    loop {
        work.into_future().await;
        loop {
            if core.stop_requested() || task::is_cancelled() {
                return;
            }
            match core.take_work() {
                Some(next) => {
                    work = next;
                    break;
                }
                // Idle workers park at the front so they are reused before
                // the master spawns new ones.
                None => core.worker_wq.wait_front().await,
            }
        }
    }
}

async fn dealer_main(core: Rc<Core>) {
    loop {
        core.drain_inbox();
        core.drain_chunks();
        core.drain_sched();
        core.timer_tick();
        if core.stop_requested() || task::is_cancelled() {
            break;
        }
        core.backend_turn();
        core.timer_tick();
        task::yield_now().await;
    }
}

/// Runtime configuration knobs recognized at init.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Worker threads; 0 means the detected CPU count (fallback 1).
    pub cores: usize,
    /// Maximum worker tasks per core.
    pub workers_max: u32,
    /// Pin each core thread to its CPU.
    pub pin_threads: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            cores: 0,
            workers_max: 256,
            pin_threads: false,
        }
    }
}

/// The running set of cores.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl Runtime {
    pub fn build(config: RuntimeConfig) -> io::Result<Runtime> {
        let ncores = if config.cores == 0 {
            detected_cpus()
        } else {
            config.cores
        };
        let backend = Arc::new(Backend::new()?);

        let mut cores = Vec::with_capacity(ncores);
        for id in 0..ncores {
            let notifier = if id == 0 {
                Notifier::Backend(backend.clone())
            } else {
                Notifier::Sleeper(Arc::new(Sleeper::new()))
            };
            cores.push(Arc::new(CoreShared {
                id: id as CoreId,
                sched: SpscRing::new(SCHED_RING_SIZE),
                inbox: SpscRing::new(INBOX_RING_SIZE),
                chunks: SpscRing::new(CHUNK_RING_SIZE),
                stop: AtomicBool::new(false),
                notifier,
            }));
        }

        let shared = Arc::new(RuntimeShared {
            cores,
            backend,
            exit: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(ncores);
        for id in 0..ncores {
            let rt = shared.clone();
            let core_shared = shared.cores[id].clone();
            let workers_max = config.workers_max;
            let pin = config.pin_threads;
            let handle = std::thread::Builder::new()
                .name(format!("core-{id}"))
                .spawn(move || {
                    if pin {
                        pin_to_cpu(id);
                    }
                    let core = Core::new(core_shared, rt, workers_max);
                    CURRENT_CORE.with(|cell| *cell.borrow_mut() = Some(core.clone()));
                    core.run();
                    CURRENT_CORE.with(|cell| cell.borrow_mut().take());
                })?;
            handles.push(handle);
        }

        tracing::info!(cores = ncores, "runtime started");
        Ok(Runtime { shared, handles })
    }

    pub fn shared(&self) -> Arc<RuntimeShared> {
        self.shared.clone()
    }

    /// Stop every core and wake it so the stop is observed.
    pub fn stop(&self) {
        for core in &self.shared.cores {
            core.request_stop();
        }
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("core thread panicked");
            }
        }
    }
}

fn detected_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn pin_to_cpu(cpu: usize) {
    // Best effort; an error leaves the thread floating.
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!(cpu, "failed to pin core thread");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpu;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future;

    fn test_runtime(cores: usize) -> Runtime {
        Runtime::build(RuntimeConfig {
            cores,
            workers_max: 8,
            pin_threads: false,
        })
        .unwrap()
    }

    #[test]
    fn submitted_work_runs() {
        let rt = test_runtime(1);
        let (promise, value) = future::future::<u32>();
        rt.shared().submit(
            0,
            Work::new(move || async move {
                promise.set(41 + 1);
            }),
        );
        let got = wait_value(value);
        assert_eq!(got, Some(42));
        rt.stop();
        rt.join();
    }

    #[test]
    fn work_spawns_tasks_that_yield() {
        let rt = test_runtime(1);
        let (promise, value) = future::future::<u64>();
        rt.shared().submit(
            0,
            Work::new(move || async move {
                let mut acc = 0u64;
                for i in 0..10 {
                    acc += i;
                    task::yield_now().await;
                }
                promise.set(acc);
            }),
        );
        assert_eq!(wait_value(value), Some(45));
        rt.stop();
        rt.join();
    }

    #[test]
    fn cross_core_submission() {
        let rt = test_runtime(2);
        let (promise, value) = future::future::<CoreId>();
        let rt_shared = rt.shared();
        // Work posted to core 1 resolves the promise with its core id.
        rt_shared.submit(
            1,
            Work::new(move || async move {
                promise.set(Core::current().id());
            }),
        );
        assert_eq!(wait_value(value), Some(1));
        rt.stop();
        rt.join();
    }

    #[test]
    fn sleep_resumes_task() {
        let rt = test_runtime(1);
        let (promise, value) = future::future::<u64>();
        let started = clock::monotonic_us();
        rt.shared().submit(
            0,
            Work::new(move || async move {
                task::sleep_us(20_000).await;
                promise.set(clock::monotonic_us());
            }),
        );
        let woke = wait_value(value).unwrap();
        assert!(woke >= started + 20_000, "woke too early");
        rt.stop();
        rt.join();
    }

    #[test]
    fn priorities_order_dispatch() {
        let rt = test_runtime(1);
        let (promise, value) = future::future::<Vec<&'static str>>();
        rt.shared().submit(
            0,
            Work::new(move || async move {
                let core = Core::current();
                let log = Rc::new(RefCell::new(Vec::new()));
                for (name, priority) in [
                    ("idle", Priority::Idle),
                    ("default", Priority::Default),
                    ("master", Priority::Master),
                ] {
                    let log = log.clone();
                    core.spawn(name, priority, async move {
                        log.borrow_mut().push(name);
                    });
                }
                // Block this worker so all three bands get to run,
                // including idle.
                task::sleep_us(20_000).await;
                promise.set(log.borrow().clone());
            }),
        );
        let order = wait_value(value).unwrap();
        assert_eq!(order, vec!["master", "default", "idle"]);
        rt.stop();
        rt.join();
    }

    #[test]
    fn stop_terminates_blocked_tasks() {
        let rt = test_runtime(2);
        rt.shared().submit(
            1,
            Work::new(move || async move {
                // Parks forever; only cancellation releases it.
                let queue = WaitQueue::new();
                queue.wait_back().await;
            }),
        );
        std::thread::sleep(Duration::from_millis(50));
        rt.stop();
        rt.join();
    }

    fn wait_value<T>(value: future::FutureValue<T>) -> Option<T> {
        // Tests run off-core; poll the future with a thread-parking waker.
        use std::task::{Context, Poll};
        let mut value = value;
        let flag = Arc::new(ParkFlag {
            parked: Mutex::new(false),
            cond: Condvar::new(),
        });
        let waker = Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            match Pin::new(&mut value).poll(&mut cx) {
                Poll::Ready(Ok(v)) => return Some(v),
                Poll::Ready(Err(_)) => return None,
                Poll::Pending => {
                    let mut parked = flag.parked.lock();
                    if !*parked {
                        flag.cond.wait_for(&mut parked, Duration::from_millis(100));
                    }
                    *parked = false;
                    if std::time::Instant::now() > deadline {
                        panic!("future did not resolve in time");
                    }
                }
            }
        }
    }

    struct ParkFlag {
        parked: Mutex<bool>,
        cond: Condvar,
    }

    impl Wake for ParkFlag {
        fn wake(self: Arc<Self>) {
            let mut parked = self.parked.lock();
            *parked = true;
            self.cond.notify_one();
        }
    }
}
