//! Per-core cooperative task runtime.
//!
//! One OS thread is bound to each CPU core. Each thread runs a
//! single-threaded cooperative dispatcher over lightweight tasks with three
//! priority bands. Cores talk to each other exclusively through bounded
//! single-consumer ring buffers; a sleeping core is woken through the event
//! backend's waker (primary core) or a timed condition (secondary cores).
//!
//! The event backend multiplexes all watched sockets on the primary core and
//! routes readiness to the owning task wherever it lives.

pub mod buffer;
pub mod clock;
pub mod core;
pub mod event;
pub mod future;
pub mod net;
pub mod ring;
pub mod runq;
pub mod spin;
pub mod task;
pub mod timeq;
pub mod wait;

mod combiner;

pub use crate::combiner::Combiner;
pub use crate::core::{
    submit_to, Core, CoreId, CoreShared, Runtime, RuntimeConfig, RuntimeShared, Work,
};
pub use crate::task::{current_task, yield_now, Priority};

use std::io;

/// Runtime error for suspension points.
///
/// A timeout is a value, not a fault: callers that armed a deadline get
/// `Timeout` back and decide what it means at their level.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("task cancelled")]
    Cancelled,
    #[error("peer closed the connection")]
    Closed,
}
