//! Cooperative tasks.
//!
//! A task is a future stored in its core's task slab, dispatched by the
//! core's single-threaded scheduler. Tasks never migrate between cores.
//! Suspension happens only at explicit points: yield, wait-queue block,
//! socket readiness, timed sleep. A task carries a cancel flag checked
//! voluntarily at those points and a LIFO stack of cleanup handlers run
//! when the task exits or is torn down.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::clock;
use crate::core::Core;
use crate::timeq::Timer;

pub type TaskId = usize;

pub const NPRIO: usize = 3;

/// Dispatch priority; lower value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// The per-core master task.
    Master = 0,
    /// Workers and connection tasks.
    Default = 1,
    /// The dealer; runs only when nothing else is runnable.
    Idle = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable: queued or about to be queued.
    Pending,
    /// Currently being polled.
    Running,
    /// Parked on a wait queue, timer, or readiness flag.
    Blocked,
    /// Finished; awaiting reaping from the dead list.
    Exited,
}

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: &'static str,
    pub(crate) priority: Priority,
    pub(crate) state: Cell<TaskState>,
    /// Wake-dedup flag: set while the task sits in the run queue or a wake
    /// arrived during its poll. Makes `run` of an already-runnable task
    /// idempotent.
    pub(crate) scheduled: Cell<bool>,
    cancelled: Cell<bool>,
    pub(crate) future: RefCell<Option<TaskFuture>>,
    cleanup: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: &'static str,
        priority: Priority,
        future: TaskFuture,
    ) -> Rc<Task> {
        Rc::new(Task {
            id,
            name,
            priority,
            state: Cell::new(TaskState::Pending),
            scheduled: Cell::new(false),
            cancelled: Cell::new(false),
            future: RefCell::new(Some(future)),
            cleanup: RefCell::new(Vec::new()),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Push a cleanup handler; handlers run LIFO when the task exits.
    pub fn push_cleanup(&self, f: impl FnOnce() + 'static) {
        self.cleanup.borrow_mut().push(Box::new(f));
    }

    /// Pop the most recent cleanup handler, running it when `run` is set.
    pub fn pop_cleanup(&self, run: bool) {
        let handler = self.cleanup.borrow_mut().pop();
        if run {
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    pub(crate) fn run_cleanups(&self) {
        loop {
            let handler = self.cleanup.borrow_mut().pop();
            match handler {
                Some(handler) => handler(),
                None => break,
            }
        }
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Rc<Task>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current_task(task: Option<Rc<Task>>) {
    CURRENT_TASK.with(|cell| *cell.borrow_mut() = task);
}

/// The task being polled on this thread. Panics outside task context.
pub fn current_task() -> Rc<Task> {
    CURRENT_TASK.with(|cell| {
        cell.borrow()
            .clone()
            .expect("current_task() called outside of a task")
    })
}

pub fn try_current_task() -> Option<Rc<Task>> {
    CURRENT_TASK.with(|cell| cell.borrow().clone())
}

/// True when the running task has been asked to unwind.
pub fn is_cancelled() -> bool {
    try_current_task().map(|t| t.is_cancelled()).unwrap_or(false)
}

/// Reschedule the current task behind its priority peers and suspend once.
pub fn yield_now() -> YieldNow {
    YieldNow { polled: false }
}

pub struct YieldNow {
    polled: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.polled {
            Poll::Ready(())
        } else {
            self.polled = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Sleep until the core's monotonic clock passes the deadline.
pub fn sleep_us(duration_us: u64) -> Sleep {
    Sleep {
        deadline_us: clock::monotonic_us() + duration_us,
        armed: false,
    }
}

pub struct Sleep {
    deadline_us: u64,
    armed: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if is_cancelled() {
            return Poll::Ready(());
        }
        if clock::monotonic_us() >= self.deadline_us {
            return Poll::Ready(());
        }
        if !self.armed {
            self.armed = true;
            let core = Core::current();
            core.add_timer(Timer {
                expiry_us: self.deadline_us,
                period_us: None,
                waker: cx.waker().clone(),
            });
        }
        Poll::Pending
    }
}
