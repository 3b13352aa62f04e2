//! Wait queues: FIFO/LIFO lists of parked tasks attached to any object.
//!
//! A waiter is a small shared cell holding the parked task's waker. `signal`
//! pops the head, marks the cell signaled and wakes the task; `broadcast`
//! does so for every waiter. `wait_front` parks at the head so that idle
//! workers are reused LIFO, ahead of the master spawning fresh ones.
//!
//! Queues are core-local: only tasks of the owning core may wait on them.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::task;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Queued,
    Signaled,
    Abandoned,
}

struct WaitEntry {
    state: Cell<WaitState>,
    waker: RefCell<Option<Waker>>,
}

impl WaitEntry {
    fn new() -> Rc<WaitEntry> {
        Rc::new(WaitEntry {
            state: Cell::new(WaitState::Queued),
            waker: RefCell::new(None),
        })
    }

    fn release(&self) {
        self.state.set(WaitState::Signaled);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

#[derive(Default)]
pub struct WaitQueue {
    waiters: RefCell<VecDeque<Rc<WaitEntry>>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the current task at the tail of the queue.
    pub fn wait_back(&self) -> Wait<'_> {
        Wait {
            queue: self,
            entry: None,
            front: false,
        }
    }

    /// Park the current task at the head of the queue.
    pub fn wait_front(&self) -> Wait<'_> {
        Wait {
            queue: self,
            entry: None,
            front: true,
        }
    }

    /// Wake the head waiter. Returns false when the queue was empty.
    pub fn signal(&self) -> bool {
        loop {
            let entry = self.waiters.borrow_mut().pop_front();
            match entry {
                Some(entry) => {
                    if entry.state.get() == WaitState::Abandoned {
                        continue;
                    }
                    entry.release();
                    return true;
                }
                None => return false,
            }
        }
    }

    /// Wake every waiter. Returns how many were woken.
    pub fn broadcast(&self) -> usize {
        let mut woken = 0;
        loop {
            let entry = self.waiters.borrow_mut().pop_front();
            match entry {
                Some(entry) => {
                    if entry.state.get() == WaitState::Abandoned {
                        continue;
                    }
                    entry.release();
                    woken += 1;
                }
                None => return woken,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.borrow().iter().all(|e| e.state.get() == WaitState::Abandoned)
    }
}

pub struct Wait<'a> {
    queue: &'a WaitQueue,
    entry: Option<Rc<WaitEntry>>,
    front: bool,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Cancellation releases the waiter; the caller re-checks its flag.
        if task::is_cancelled() {
            if let Some(entry) = self.entry.take() {
                entry.state.set(WaitState::Abandoned);
            }
            return Poll::Ready(());
        }
        match self.entry {
            Some(ref entry) => {
                if entry.state.get() == WaitState::Signaled {
                    self.entry = None;
                    Poll::Ready(())
                } else {
                    *entry.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
            None => {
                let entry = WaitEntry::new();
                *entry.waker.borrow_mut() = Some(cx.waker().clone());
                if self.front {
                    self.queue.waiters.borrow_mut().push_front(entry.clone());
                } else {
                    self.queue.waiters.borrow_mut().push_back(entry.clone());
                }
                self.entry = Some(entry);
                Poll::Pending
            }
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        // A dropped waiter must not swallow a future signal.
        if let Some(entry) = self.entry.take() {
            if entry.state.get() == WaitState::Queued {
                entry.state.set(WaitState::Abandoned);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct Flag(AtomicUsize);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn poll_once<F: Future>(future: &mut F, waker: &Waker) -> Poll<F::Output> {
        let mut cx = Context::from_waker(waker);
        // Safety: the future is not moved between polls in these tests.
        unsafe { Pin::new_unchecked(future) }.poll(&mut cx)
    }

    #[test]
    fn signal_wakes_head_in_fifo_order() {
        let queue = WaitQueue::new();
        let flag_a = Arc::new(Flag(AtomicUsize::new(0)));
        let flag_b = Arc::new(Flag(AtomicUsize::new(0)));
        let waker_a = Waker::from(flag_a.clone());
        let waker_b = Waker::from(flag_b.clone());

        let mut wait_a = queue.wait_back();
        let mut wait_b = queue.wait_back();
        assert!(poll_once(&mut wait_a, &waker_a).is_pending());
        assert!(poll_once(&mut wait_b, &waker_b).is_pending());

        assert!(queue.signal());
        assert_eq!(flag_a.0.load(Ordering::SeqCst), 1);
        assert_eq!(flag_b.0.load(Ordering::SeqCst), 0);
        assert!(poll_once(&mut wait_a, &waker_a).is_ready());
        assert!(poll_once(&mut wait_b, &waker_b).is_pending());

        assert!(queue.signal());
        assert!(poll_once(&mut wait_b, &waker_b).is_ready());
        assert!(!queue.signal());
    }

    #[test]
    fn wait_front_wakes_before_wait_back() {
        let queue = WaitQueue::new();
        let back_flag = Arc::new(Flag(AtomicUsize::new(0)));
        let front_flag = Arc::new(Flag(AtomicUsize::new(0)));
        let back_waker = Waker::from(back_flag.clone());
        let front_waker = Waker::from(front_flag.clone());

        let mut back = queue.wait_back();
        assert!(poll_once(&mut back, &back_waker).is_pending());
        let mut front = queue.wait_front();
        assert!(poll_once(&mut front, &front_waker).is_pending());

        assert!(queue.signal());
        assert_eq!(front_flag.0.load(Ordering::SeqCst), 1);
        assert_eq!(back_flag.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn broadcast_wakes_all() {
        let queue = WaitQueue::new();
        let mut waits = Vec::new();
        let mut flags = Vec::new();
        for _ in 0..5 {
            let flag = Arc::new(Flag(AtomicUsize::new(0)));
            let waker = Waker::from(flag.clone());
            let mut wait = Box::new(queue.wait_back());
            assert!(poll_once(&mut *wait, &waker).is_pending());
            waits.push((wait, waker));
            flags.push(flag);
        }
        assert_eq!(queue.broadcast(), 5);
        for flag in &flags {
            assert_eq!(flag.0.load(Ordering::SeqCst), 1);
        }
        for (mut wait, waker) in waits {
            assert!(poll_once(&mut *wait, &waker).is_ready());
        }
    }

    #[test]
    fn dropped_waiter_does_not_eat_signal() {
        let queue = WaitQueue::new();
        let dead_flag = Arc::new(Flag(AtomicUsize::new(0)));
        let live_flag = Arc::new(Flag(AtomicUsize::new(0)));
        let dead_waker = Waker::from(dead_flag.clone());
        let live_waker = Waker::from(live_flag.clone());

        {
            let mut dead = queue.wait_back();
            assert!(poll_once(&mut dead, &dead_waker).is_pending());
            // dropped while still queued
        }
        let mut live = queue.wait_back();
        assert!(poll_once(&mut live, &live_waker).is_pending());

        assert!(queue.signal());
        assert_eq!(dead_flag.0.load(Ordering::SeqCst), 0);
        assert_eq!(live_flag.0.load(Ordering::SeqCst), 1);
        assert!(poll_once(&mut live, &live_waker).is_ready());
    }
}
