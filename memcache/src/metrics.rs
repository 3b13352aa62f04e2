//! Engine metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "cache_gets", description = "Total GET/GETS key lookups")]
pub static GETS: Counter = Counter::new();

#[metric(name = "cache_sets", description = "Total storage commands")]
pub static SETS: Counter = Counter::new();

#[metric(name = "cache_deletes", description = "Total DELETE operations")]
pub static DELETES: Counter = Counter::new();

#[metric(name = "cache_flushes", description = "Total FLUSH_ALL operations")]
pub static FLUSHES: Counter = Counter::new();

#[metric(name = "cache_hits", description = "Total cache hits")]
pub static HITS: Counter = Counter::new();

#[metric(name = "cache_misses", description = "Total cache misses")]
pub static MISSES: Counter = Counter::new();

#[metric(name = "cache_evictions", description = "Entries evicted by the clock hand")]
pub static EVICTIONS: Counter = Counter::new();

#[metric(
    name = "cache_expansions",
    description = "Incremental hash-table stride steps performed"
)]
pub static EXPANSIONS: Counter = Counter::new();

#[metric(
    name = "cache_set_errors",
    description = "Storage commands rejected for lack of memory"
)]
pub static SET_ERRORS: Counter = Counter::new();

#[metric(name = "protocol_errors", description = "Protocol parse errors")]
pub static PROTOCOL_ERRORS: Counter = Counter::new();
