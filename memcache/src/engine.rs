//! Command processing and server wiring.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use mm_runtime::net::{TcpAcceptor, TcpConn};
use mm_runtime::{submit_to, Core, CoreId, Error, Priority, RuntimeShared, Work};

use crate::command::CmdResult;
use crate::conn::{reader_task, writer_task, McConn};
use crate::entry::Entry;
use crate::metrics::{
    CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, DELETES, FLUSHES, GETS, HITS, MISSES, SETS,
    SET_ERRORS,
};
use crate::parser::{ParsedCommand, StoreKind};
use crate::table::{CacheConfig, Table};

pub struct Memcache {
    table: Arc<Table>,
    verbosity: AtomicU32,
    /// Realtime µs recorded by the last flush_all; the delay argument is
    /// accepted and remembered but entries are flushed at once.
    flush_time_us: AtomicU64,
}

impl Memcache {
    pub fn new(config: &CacheConfig) -> Arc<Memcache> {
        Arc::new(Memcache {
            table: Table::new(config),
            verbosity: AtomicU32::new(0),
            flush_time_us: AtomicU64::new(0),
        })
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn verbosity(&self) -> u32 {
        self.verbosity.load(Ordering::Relaxed)
    }

    /// Realtime µs of the last flush_all, offset by its delay argument.
    pub fn flush_time_us(&self) -> u64 {
        self.flush_time_us.load(Ordering::Relaxed)
    }

    /// Execute one parsed command against the table and produce its result.
    pub(crate) async fn process(self: &Arc<Self>, cmd: ParsedCommand) -> CmdResult {
        match cmd {
            ParsedCommand::Get { keys, with_cas } => {
                let mut entries = Vec::with_capacity(keys.len());
                for key in &keys {
                    GETS.increment();
                    match self.table.lookup(key).await {
                        Some(entry) => {
                            HITS.increment();
                            entries.push(entry);
                        }
                        None => { MISSES.increment(); }
                    }
                }
                CmdResult::Entries { entries, with_cas }
            }

            ParsedCommand::Store {
                kind,
                key,
                flags,
                exptime,
                data,
                noreply,
            } => {
                SETS.increment();
                let outcome = match kind {
                    StoreKind::Set => {
                        if !self.table.create(&key, data.len()).await {
                            SET_ERRORS.increment();
                            return reply(noreply, "SERVER_ERROR out of memory\r\n");
                        }
                        let entry = Entry::new(key.clone(), data, flags, exptime);
                        self.table.upsert(&key, entry).await;
                        "STORED\r\n"
                    }
                    StoreKind::Add => {
                        if !self.table.create(&key, data.len()).await {
                            SET_ERRORS.increment();
                            return reply(noreply, "SERVER_ERROR out of memory\r\n");
                        }
                        let entry = Entry::new(key.clone(), data, flags, exptime);
                        if self.table.insert(&key, entry).await {
                            "STORED\r\n"
                        } else {
                            "NOT_STORED\r\n"
                        }
                    }
                    StoreKind::Replace => {
                        if !self.table.create(&key, data.len()).await {
                            SET_ERRORS.increment();
                            return reply(noreply, "SERVER_ERROR out of memory\r\n");
                        }
                        let entry = Entry::new(key.clone(), data, flags, exptime);
                        let (matched, _) = self.table.update(&key, entry, None).await;
                        if matched {
                            "STORED\r\n"
                        } else {
                            "NOT_STORED\r\n"
                        }
                    }
                    StoreKind::Append | StoreKind::Prepend => {
                        match self.table.lookup(&key).await {
                            None => "NOT_STORED\r\n",
                            Some(old) => {
                                // The entry actually built is the
                                // concatenation; admission must be sized
                                // against it, not the fragment.
                                let combined = old.value().len() + data.len();
                                if !self.table.create(&key, combined).await {
                                    SET_ERRORS.increment();
                                    return reply(noreply, "SERVER_ERROR out of memory\r\n");
                                }
                                let mut value = BytesMut::with_capacity(combined);
                                if kind == StoreKind::Append {
                                    value.extend_from_slice(old.value());
                                    value.extend_from_slice(&data);
                                } else {
                                    value.extend_from_slice(&data);
                                    value.extend_from_slice(old.value());
                                }
                                let entry = Entry::new(
                                    key.clone(),
                                    value.freeze(),
                                    old.flags(),
                                    old.exptime(),
                                );
                                let (matched, _) = self.table.update(&key, entry, None).await;
                                if matched {
                                    "STORED\r\n"
                                } else {
                                    "NOT_STORED\r\n"
                                }
                            }
                        }
                    }
                };
                reply(noreply, outcome)
            }

            ParsedCommand::Cas {
                key,
                flags,
                exptime,
                data,
                stamp,
                noreply,
            } => {
                SETS.increment();
                if !self.table.create(&key, data.len()).await {
                    SET_ERRORS.increment();
                    return reply(noreply, "SERVER_ERROR out of memory\r\n");
                }
                let entry = Entry::new(key.clone(), data, flags, exptime);
                let (matched, existing) = self.table.update(&key, entry, Some(stamp)).await;
                let outcome = if matched {
                    "STORED\r\n"
                } else if existing.is_some() {
                    "EXISTS\r\n"
                } else {
                    "NOT_FOUND\r\n"
                };
                reply(noreply, outcome)
            }

            ParsedCommand::Arith {
                decr,
                key,
                delta,
                noreply,
            } => match self.table.lookup(&key).await {
                None => reply(noreply, "NOT_FOUND\r\n"),
                Some(old) => match old.value_u64() {
                    None => reply(
                        noreply,
                        "CLIENT_ERROR cannot increment or decrement non-numeric value\r\n",
                    ),
                    Some(current) => {
                        let updated = if decr {
                            current.saturating_sub(delta)
                        } else {
                            current.wrapping_add(delta)
                        };
                        let entry = Entry::new(
                            key.clone(),
                            Entry::format_u64(updated),
                            old.flags(),
                            old.exptime(),
                        );
                        let (matched, _) = self.table.update(&key, entry.clone(), None).await;
                        if !matched {
                            reply(noreply, "NOT_FOUND\r\n")
                        } else if noreply {
                            CmdResult::Blank
                        } else {
                            CmdResult::Value(entry)
                        }
                    }
                },
            },

            ParsedCommand::Delete { key, noreply } => {
                DELETES.increment();
                let removed = self.table.delete(&key).await.is_some();
                if removed {
                    reply(noreply, "DELETED\r\n")
                } else {
                    reply(noreply, "NOT_FOUND\r\n")
                }
            }

            ParsedCommand::Touch { .. } => CmdResult::Reply("SERVER_ERROR not implemented\r\n"),

            ParsedCommand::FlushAll { delay, noreply } => {
                FLUSHES.increment();
                let when = mm_runtime::clock::realtime_us() + (delay as u64) * 1_000_000;
                self.flush_time_us.store(when, Ordering::Relaxed);
                self.table.flush_all().await;
                reply(noreply, "OK\r\n")
            }

            ParsedCommand::Verbosity { level, noreply } => {
                self.verbosity.store(level.min(2), Ordering::Relaxed);
                reply(noreply, "OK\r\n")
            }

            ParsedCommand::Reply(text) => CmdResult::Reply(text),

            ParsedCommand::Quit => CmdResult::Quit,
        }
    }
}

fn reply(noreply: bool, text: &'static str) -> CmdResult {
    if noreply {
        CmdResult::Blank
    } else {
        CmdResult::Reply(text)
    }
}

/// Accept loop: runs on the primary core, handing each connection to a core
/// round-robin through its inbox ring.
pub async fn listen_task(rt: Arc<RuntimeShared>, cache: Arc<Memcache>, acceptor: TcpAcceptor) {
    let ncores = rt.ncores();
    let mut next_core = 0usize;
    loop {
        match acceptor.accept().await {
            Ok((stream, peer)) => {
                CONNECTIONS_ACCEPTED.increment();
                let target = (next_core % ncores) as CoreId;
                next_core = next_core.wrapping_add(1);
                tracing::debug!(%peer, core = target, "connection accepted");
                let cache = cache.clone();
                let rt_for_conn = rt.clone();
                submit_to(
                    rt.clone(),
                    target,
                    Work::new(move || conn_main(stream, rt_for_conn, cache)),
                )
                .await;
            }
            Err(Error::Cancelled) => break,
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                break;
            }
        }
    }
}

/// Connection body, running as a worker task on the connection's core.
async fn conn_main(stream: mio::net::TcpStream, rt: Arc<RuntimeShared>, cache: Arc<Memcache>) {
    let io = match TcpConn::from_mio(stream, rt.backend().clone()) {
        Ok(io) => io,
        Err(error) => {
            tracing::warn!(%error, "failed to register connection");
            return;
        }
    };
    CONNECTIONS_ACTIVE.increment();
    let conn = McConn::new(io);
    let core = Core::current();
    core.spawn("mc-writer", Priority::Default, writer_task(conn.clone()));
    reader_task(conn, cache).await;
    CONNECTIONS_ACTIVE.decrement();
}
