//! Memcache-compatible in-memory key/value engine.
//!
//! The store is split into a power-of-two number of partitions, each with
//! its own open-addressed bucket array that grows in place by incremental
//! striding, a CLOCK eviction hand, and a CAS stamp counter. Partition
//! access goes through one of three serialization strategies selected at
//! startup: a task spinlock, delegation to the partition's owning core, or
//! a combining lock.
//!
//! The protocol plane parses the memcached ASCII protocol off a streaming
//! receive buffer, routes each command to its partition, and transmits
//! replies in parse order from a per-connection FIFO.

pub mod action;
pub mod command;
pub mod conn;
pub mod engine;
pub mod entry;
pub mod metrics;
pub mod parser;
pub mod table;

pub use crate::engine::{listen_task, Memcache};
pub use crate::table::{AccessMode, CacheConfig, Table};
