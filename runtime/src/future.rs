//! One-shot result cells shared between a producer and waiting tasks.
//!
//! The producing side stores a value exactly once and wakes every parked
//! waiter; the consuming side awaits readiness and takes the value. The cell
//! crosses cores: the delegate partition strategy fulfills promises on the
//! partition's owning core while the requester sleeps on its own core.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Ready,
    Cancelled,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    state: FutureState,
    value: Option<T>,
    waiters: Vec<Waker>,
}

/// Producer half; fulfilling or cancelling consumes it.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half; awaiting yields `Ok(value)` or `Err(Cancelled)`.
pub struct FutureValue<T> {
    shared: Arc<Shared<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

pub fn future<T>() -> (Promise<T>, FutureValue<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            state: FutureState::Pending,
            value: None,
            waiters: Vec::new(),
        }),
    });
    (
        Promise {
            shared: shared.clone(),
        },
        FutureValue { shared },
    )
}

impl<T> Promise<T> {
    pub fn set(self, value: T) {
        let waiters = {
            let mut inner = self.shared.inner.lock();
            inner.state = FutureState::Ready;
            inner.value = Some(value);
            std::mem::take(&mut inner.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }

    pub fn cancel(self) {
        let waiters = {
            let mut inner = self.shared.inner.lock();
            inner.state = FutureState::Cancelled;
            std::mem::take(&mut inner.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }
}

impl<T> FutureValue<T> {
    pub fn state(&self) -> FutureState {
        self.shared.inner.lock().state
    }
}

impl<T> Future for FutureValue<T> {
    type Output = Result<T, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            FutureState::Ready => match inner.value.take() {
                Some(value) => Poll::Ready(Ok(value)),
                // A second waiter after the value was taken.
                None => Poll::Ready(Err(Cancelled)),
            },
            FutureState::Cancelled => Poll::Ready(Err(Cancelled)),
            FutureState::Pending => {
                if task::is_cancelled() {
                    return Poll::Ready(Err(Cancelled));
                }
                inner.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct Flag(AtomicUsize);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn poll_once<F: Future + Unpin>(future: &mut F, waker: &Waker) -> Poll<F::Output> {
        let mut cx = Context::from_waker(waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn set_before_poll() {
        let (promise, mut value) = future::<u32>();
        promise.set(7);
        let waker = Waker::from(Arc::new(Flag(AtomicUsize::new(0))));
        assert_eq!(poll_once(&mut value, &waker), Poll::Ready(Ok(7)));
    }

    #[test]
    fn set_wakes_waiter() {
        let (promise, mut value) = future::<u32>();
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        let waker = Waker::from(flag.clone());
        assert!(poll_once(&mut value, &waker).is_pending());
        assert_eq!(value.state(), FutureState::Pending);
        promise.set(42);
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
        assert_eq!(poll_once(&mut value, &waker), Poll::Ready(Ok(42)));
    }

    #[test]
    fn cancel_resolves_with_error() {
        let (promise, mut value) = future::<u32>();
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        let waker = Waker::from(flag.clone());
        assert!(poll_once(&mut value, &waker).is_pending());
        promise.cancel();
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
        assert_eq!(poll_once(&mut value, &waker), Poll::Ready(Err(Cancelled)));
    }

    #[test]
    fn cross_thread_fulfillment() {
        let (promise, mut value) = future::<String>();
        let handle = std::thread::spawn(move || {
            promise.set("done".to_string());
        });
        handle.join().unwrap();
        let waker = Waker::from(Arc::new(Flag(AtomicUsize::new(0))));
        assert_eq!(
            poll_once(&mut value, &waker),
            Poll::Ready(Ok("done".to_string()))
        );
    }
}
