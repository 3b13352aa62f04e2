//! Per-connection reader and writer tasks.
//!
//! The reader fills the receive buffer, parses complete commands, and
//! processes each in parse order (partition access may suspend under the
//! delegate strategy, but the next command is not started until the current
//! one finishes, so per-connection ordering is program order). Results land
//! in the connection FIFO and the writer is kicked.
//!
//! The writer walks the FIFO head while results are terminal, encodes them
//! into the egress chain, transmits, then releases the receive buffer up to
//! the last transmitted command's end pointer. A QUIT result closes the
//! connection after everything before it has flushed; peer hangup enqueues
//! exactly such a QUIT.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use mm_runtime::buffer::TxBuf;
use mm_runtime::net::TcpConn;
use mm_runtime::task;
use mm_runtime::wait::WaitQueue;
use mm_runtime::{Core, Error};

use crate::command::{self, Command, CommandFifo, CmdResult};
use crate::engine::Memcache;
use crate::metrics::PROTOCOL_ERRORS;
use crate::parser::{self, ParseOutcome, ParsedCommand};

/// Reads idle this long before re-checking for shutdown.
const READ_TIMEOUT_US: u64 = 10_000_000;

pub struct McConn {
    pub(crate) io: TcpConn,
    pub(crate) inner: RefCell<McInner>,
    pub(crate) writer_wq: WaitQueue,
}

pub(crate) struct McInner {
    pub rbuf: BytesMut,
    /// Stream offset of `rbuf[0]`.
    pub rbuf_off: u64,
    /// Stream offset of the parse cursor.
    pub parse_off: u64,
    /// True while the reader has the buffer checked out for a read; the
    /// writer defers releases to `release_off` instead of touching it.
    pub rbuf_taken: bool,
    /// Highest transmitted end offset not yet released from the buffer.
    pub release_off: u64,
    pub fifo: CommandFifo,
    pub tx: TxBuf,
}

impl McInner {
    /// Drop fully transmitted input from the front of the buffer.
    fn release_to(&mut self, end: u64) {
        if self.rbuf_taken {
            self.release_off = self.release_off.max(end);
            return;
        }
        if end > self.rbuf_off {
            let n = (end - self.rbuf_off) as usize;
            self.rbuf.advance(n);
            self.rbuf_off = end;
        }
    }
}

impl McConn {
    pub fn new(io: TcpConn) -> Rc<McConn> {
        Rc::new(McConn {
            io,
            inner: RefCell::new(McInner {
                rbuf: BytesMut::with_capacity(16 * 1024),
                rbuf_off: 0,
                parse_off: 0,
                rbuf_taken: false,
                release_off: 0,
                fifo: CommandFifo::new(),
                tx: TxBuf::new(),
            }),
            writer_wq: WaitQueue::new(),
        })
    }

    /// Queue a QUIT so results already computed still flush in order.
    fn push_quit(&self) {
        let mut inner = self.inner.borrow_mut();
        let end_off = inner.parse_off;
        inner.fifo.push_back(Command {
            result: CmdResult::Quit,
            end_off,
        });
        drop(inner);
        self.writer_wq.signal();
    }
}

pub async fn reader_task(conn: Rc<McConn>, cache: Arc<Memcache>) {
    conn.io.set_read_timeout_us(Some(READ_TIMEOUT_US));

    'outer: loop {
        if task::is_cancelled() || Core::current().stop_requested() {
            conn.push_quit();
            break;
        }

        // Drain every complete command already buffered.
        loop {
            let outcome = {
                let inner = conn.inner.borrow();
                let start = (inner.parse_off - inner.rbuf_off) as usize;
                parser::parse(&inner.rbuf[start..])
            };
            match outcome {
                ParseOutcome::Cmd { cmd, consumed } => {
                    let end_off = {
                        let mut inner = conn.inner.borrow_mut();
                        inner.parse_off += consumed as u64;
                        inner.parse_off
                    };
                    if let ParsedCommand::Reply(text) = &cmd {
                        if text.starts_with("ERROR")
                            || text.starts_with("CLIENT_ERROR")
                            || text.starts_with("SERVER_ERROR")
                        {
                            PROTOCOL_ERRORS.increment();
                        }
                    }
                    let result = cache.process(cmd).await;
                    let quit = matches!(result, CmdResult::Quit);
                    conn.inner
                        .borrow_mut()
                        .fifo
                        .push_back(Command { result, end_off });
                    conn.writer_wq.signal();
                    if quit {
                        break 'outer;
                    }
                }
                ParseOutcome::NeedMore => break,
                ParseOutcome::QuitFast => {
                    tracing::debug!("quit-fast: no command boundary in sight");
                    conn.push_quit();
                    break 'outer;
                }
            }
        }

        // Get more input. The buffer is taken out for the await and put
        // back; offsets are stream-absolute so this is invisible to the
        // parser, and the writer defers releases while it is out.
        let mut rbuf = {
            let mut inner = conn.inner.borrow_mut();
            inner.rbuf_taken = true;
            std::mem::take(&mut inner.rbuf)
        };
        let received = conn.io.recv(&mut rbuf).await;
        {
            let mut inner = conn.inner.borrow_mut();
            inner.rbuf = rbuf;
            inner.rbuf_taken = false;
            let pending = inner.release_off;
            inner.release_to(pending);
        }

        match received {
            Ok(_) => {}
            Err(Error::Timeout) => {}
            Err(Error::Closed) => {
                conn.push_quit();
                break;
            }
            Err(error) => {
                tracing::debug!(%error, "connection read failed");
                conn.push_quit();
                break;
            }
        }
    }
}

pub async fn writer_task(conn: Rc<McConn>) {
    loop {
        let ready = {
            let inner = conn.inner.borrow();
            !inner.tx.is_empty()
                || inner
                    .fifo
                    .front()
                    .map(|cmd| !matches!(cmd.result, CmdResult::None))
                    .unwrap_or(false)
        };
        if !ready {
            if task::is_cancelled() {
                break;
            }
            conn.writer_wq.wait_back().await;
            if task::is_cancelled() {
                break;
            }
            continue;
        }

        // Encode the ready prefix, preserving submission order: a command
        // with no result parks the writer until processing catches up.
        let (quit, last_end) = {
            let mut inner_ref = conn.inner.borrow_mut();
            let inner = &mut *inner_ref;
            let mut quit = false;
            let mut last_end = None;
            while let Some(front) = inner.fifo.front() {
                if matches!(front.result, CmdResult::None) {
                    break;
                }
                let cmd = inner.fifo.pop_front().expect("checked front");
                last_end = Some(cmd.end_off);
                if command::encode(&mut inner.tx, cmd.result) {
                    quit = true;
                    break;
                }
            }
            (quit, last_end)
        };

        let mut tx = std::mem::take(&mut conn.inner.borrow_mut().tx);
        let sent = conn.io.send_buf(&mut tx).await;
        conn.inner.borrow_mut().tx = tx;

        // Release fully consumed input.
        if let Some(end) = last_end {
            conn.inner.borrow_mut().release_to(end);
        }

        if quit {
            break;
        }
        if let Err(error) = sent {
            tracing::debug!(%error, "connection write failed");
            break;
        }
    }
}
