//! Commands in flight and response encoding.
//!
//! Every parsed command joins its connection's FIFO with `result == None`.
//! Processing stamps a terminal result; the writer consumes the FIFO prefix
//! of finished commands, encoding each into the egress chain. Entry values
//! are spliced as refcounted views rather than copied.

use std::collections::VecDeque;
use std::sync::Arc;

use mm_runtime::buffer::TxBuf;

use crate::entry::Entry;

pub enum CmdResult {
    /// Still being processed; the writer must not pass this command.
    None,
    /// noreply: emit nothing.
    Blank,
    /// A literal reply line.
    Reply(&'static str),
    /// get/gets hits: VALUE lines terminated by END.
    Entries {
        entries: Vec<Arc<Entry>>,
        with_cas: bool,
    },
    /// incr/decr: the entry's decimal value.
    Value(Arc<Entry>),
    /// Close the connection after transmitting everything before it.
    Quit,
}

pub struct Command {
    pub result: CmdResult,
    /// Stream offset just past this command's input; the receive buffer is
    /// released up to here once the result is transmitted.
    pub end_off: u64,
}

pub type CommandFifo = VecDeque<Command>;

/// Encode one result into the egress chain. Returns true for QUIT.
pub fn encode(tx: &mut TxBuf, result: CmdResult) -> bool {
    match result {
        CmdResult::None => unreachable!("encoding an unfinished command"),
        CmdResult::Blank => false,
        CmdResult::Reply(text) => {
            tx.append(text.as_bytes());
            false
        }
        CmdResult::Entries { entries, with_cas } => {
            let mut line = Vec::with_capacity(64);
            for entry in entries {
                line.clear();
                line.extend_from_slice(b"VALUE ");
                line.extend_from_slice(entry.key());
                line.push(b' ');
                let mut numbers = itoa::Buffer::new();
                line.extend_from_slice(numbers.format(entry.flags()).as_bytes());
                line.push(b' ');
                line.extend_from_slice(numbers.format(entry.value().len()).as_bytes());
                if with_cas {
                    line.push(b' ');
                    line.extend_from_slice(numbers.format(entry.stamp()).as_bytes());
                }
                line.extend_from_slice(b"\r\n");
                tx.append(&line);
                tx.splice(entry.value_bytes());
                tx.append(b"\r\n");
            }
            tx.append(b"END\r\n");
            false
        }
        CmdResult::Value(entry) => {
            tx.splice(entry.value_bytes());
            tx.append(b"\r\n");
            false
        }
        CmdResult::Quit => true,
    }
}
