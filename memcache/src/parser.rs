//! Streaming parser for the memcached ASCII protocol.
//!
//! The parser runs over the connection's receive buffer and either yields a
//! complete command plus the bytes it consumed, asks for more input, or
//! declares the peer hopeless. Parsing is resumable by re-running on the
//! grown buffer: the outcome for a given prefix is deterministic, so no
//! state is carried between attempts.
//!
//! The first four bytes identify the command; the remainder is tokens of at
//! most 250 bytes, decimal integers, an optional `noreply`, and a CR-optional
//! LF terminator. The set family additionally captures an exact-length
//! payload. On a malformed command everything up to the next LF is consumed
//! and an error reply is produced; a peer that scrolls more than 1,024 junk
//! bytes without a command boundary is cut off.

use bytes::Bytes;

use crate::entry::KEY_LEN_MAX;

/// Junk tolerated while hunting for a command boundary.
const JUNK_MAX: usize = 1024;

const VERSION_REPLY: &str = concat!("VERSION ", env!("CARGO_PKG_VERSION"), "\r\n");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Get {
        keys: Vec<Bytes>,
        with_cas: bool,
    },
    Store {
        kind: StoreKind,
        key: Bytes,
        flags: u32,
        exptime: u32,
        data: Bytes,
        noreply: bool,
    },
    Cas {
        key: Bytes,
        flags: u32,
        exptime: u32,
        data: Bytes,
        stamp: u64,
        noreply: bool,
    },
    Arith {
        decr: bool,
        key: Bytes,
        delta: u64,
        noreply: bool,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    Touch {
        key: Bytes,
        exptime: u32,
        noreply: bool,
    },
    FlushAll {
        delay: u32,
        noreply: bool,
    },
    Verbosity {
        level: u32,
        noreply: bool,
    },
    /// A reply decided at parse time: version, stats, and every error.
    Reply(&'static str),
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    Cmd { cmd: ParsedCommand, consumed: usize },
    /// Incomplete input; retry once more bytes arrive.
    NeedMore,
    /// The peer is hopeless; stop reading and close.
    QuitFast,
}

enum Abort {
    NeedMore,
    Quit,
    Error(&'static str),
}

type PResult<T> = Result<T, Abort>;

pub fn parse(buf: &[u8]) -> ParseOutcome {
    let mut scanner = Scanner { buf, pos: 0 };
    match parse_inner(&mut scanner) {
        Ok(cmd) => ParseOutcome::Cmd {
            cmd,
            consumed: scanner.pos,
        },
        Err(Abort::NeedMore) => ParseOutcome::NeedMore,
        Err(Abort::Quit) => ParseOutcome::QuitFast,
        Err(Abort::Error(msg)) => {
            // Recover by consuming through the next LF.
            match buf[scanner.pos..].iter().position(|&b| b == b'\n') {
                Some(offset) => ParseOutcome::Cmd {
                    cmd: ParsedCommand::Reply(msg),
                    consumed: scanner.pos + offset + 1,
                },
                None if buf.len() - scanner.pos > JUNK_MAX => ParseOutcome::QuitFast,
                None => ParseOutcome::NeedMore,
            }
        }
    }
}

struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn need(&self, n: usize) -> PResult<()> {
        if self.pos + n <= self.buf.len() {
            Ok(())
        } else {
            Err(Abort::NeedMore)
        }
    }

    fn skip_spaces(&mut self) -> PResult<()> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] == b' ' {
            self.pos += 1;
            if self.pos - start > JUNK_MAX {
                return Err(Abort::Quit);
            }
        }
        Ok(())
    }

    /// One space-separated token, left at its delimiter. `Ok(None)` means
    /// the line ended with no token, permitted when not required.
    fn token(&mut self, required: bool) -> PResult<Option<&'a [u8]>> {
        self.skip_spaces()?;
        let start = self.pos;
        loop {
            self.need(1)?;
            match self.buf[self.pos] {
                b' ' | b'\n' => break,
                b'\r' => {
                    self.need(2)?;
                    if self.buf[self.pos + 1] == b'\n' {
                        break;
                    }
                    // A stray CR belongs to the token.
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
            if self.pos - start > KEY_LEN_MAX {
                return Err(Abort::Error("CLIENT_ERROR parameter is too long\r\n"));
            }
        }
        let token = &self.buf[start..self.pos];
        if token.is_empty() {
            if required {
                Err(Abort::Error("CLIENT_ERROR missing parameter\r\n"))
            } else {
                Ok(None)
            }
        } else {
            Ok(Some(token))
        }
    }

    fn parse_u32(&mut self) -> PResult<u32> {
        let token = self.token(true)?.expect("required token");
        digits_u64(token)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(Abort::Error("CLIENT_ERROR invalid number parameter\r\n"))
    }

    fn parse_u64(&mut self) -> PResult<u64> {
        let token = self.token(true)?.expect("required token");
        digits_u64(token).ok_or(Abort::Error("CLIENT_ERROR invalid number parameter\r\n"))
    }

    fn noreply(&mut self) -> PResult<bool> {
        const NOREPLY: &[u8] = b"noreply";
        self.skip_spaces()?;
        let rest = &self.buf[self.pos..];
        let n = rest.len().min(NOREPLY.len());
        if rest[..n] != NOREPLY[..n] {
            return Ok(false);
        }
        if n < NOREPLY.len() {
            return Err(Abort::NeedMore);
        }
        self.pos += NOREPLY.len();
        Ok(true)
    }

    /// Consume the CR-optional LF line terminator, skipping spaces.
    fn eol(&mut self) -> PResult<()> {
        let start = self.pos;
        loop {
            self.need(1)?;
            let c = self.buf[self.pos];
            self.pos += 1;
            match c {
                b' ' => {
                    if self.pos - start > JUNK_MAX {
                        return Err(Abort::Quit);
                    }
                }
                b'\r' => {
                    self.need(1)?;
                    let c = self.buf[self.pos];
                    self.pos += 1;
                    return if c == b'\n' {
                        Ok(())
                    } else {
                        Err(Abort::Error("CLIENT_ERROR unexpected parameter\r\n"))
                    };
                }
                b'\n' => return Ok(()),
                _ => return Err(Abort::Error("CLIENT_ERROR unexpected parameter\r\n")),
            }
        }
    }

    /// An exact-length payload followed by its CR-optional LF.
    fn data(&mut self, nbytes: usize) -> PResult<Bytes> {
        self.need(nbytes)?;
        let start = self.pos;
        self.pos += nbytes;
        self.need(1)?;
        match self.buf[self.pos] {
            b'\n' => {
                self.pos += 1;
            }
            b'\r' => {
                self.need(2)?;
                if self.buf[self.pos + 1] != b'\n' {
                    return Err(Abort::Error("CLIENT_ERROR bad data chunk\r\n"));
                }
                self.pos += 2;
            }
            _ => return Err(Abort::Error("CLIENT_ERROR bad data chunk\r\n")),
        }
        Ok(Bytes::copy_from_slice(&self.buf[start..start + nbytes]))
    }

    /// The remaining characters of a command name, then a delimiter.
    fn expect_rest(&mut self, rest: &[u8]) -> PResult<()> {
        for &expected in rest {
            self.need(1)?;
            if self.buf[self.pos] != expected {
                return Err(Abort::Error("ERROR\r\n"));
            }
            self.pos += 1;
        }
        self.need(1)?;
        match self.buf[self.pos] {
            b' ' | b'\r' | b'\n' => Ok(()),
            _ => Err(Abort::Error("ERROR\r\n")),
        }
    }
}

fn digits_u64(token: &[u8]) -> Option<u64> {
    let mut acc: u64 = 0;
    for &byte in token {
        if !byte.is_ascii_digit() {
            return None;
        }
        acc = acc.checked_mul(10)?.checked_add((byte - b'0') as u64)?;
    }
    Some(acc)
}

fn parse_inner(s: &mut Scanner<'_>) -> PResult<ParsedCommand> {
    s.skip_spaces()?;

    // The first four bytes are enough to identify any command.
    let mut name = [0u8; 4];
    for slot in name.iter_mut() {
        s.need(1)?;
        let c = s.buf[s.pos];
        if c == b'\n' {
            // Unexpected line end; recovery will consume it.
            return Err(Abort::Error("ERROR\r\n"));
        }
        *slot = c;
        s.pos += 1;
    }

    match &name {
        b"get " => get_fields(s, false),
        b"gets" => {
            s.expect_rest(b"")?;
            get_fields(s, true)
        }
        b"set " => store_fields(s, StoreKind::Set),
        b"add " => store_fields(s, StoreKind::Add),
        b"repl" => {
            s.expect_rest(b"ace")?;
            store_fields(s, StoreKind::Replace)
        }
        b"appe" => {
            s.expect_rest(b"nd")?;
            store_fields(s, StoreKind::Append)
        }
        b"prep" => {
            s.expect_rest(b"end")?;
            store_fields(s, StoreKind::Prepend)
        }
        b"cas " => cas_fields(s),
        b"incr" => {
            s.expect_rest(b"")?;
            arith_fields(s, false)
        }
        b"decr" => {
            s.expect_rest(b"")?;
            arith_fields(s, true)
        }
        b"dele" => {
            s.expect_rest(b"te")?;
            delete_fields(s)
        }
        b"touc" => {
            s.expect_rest(b"h")?;
            touch_fields(s)
        }
        b"slab" => {
            s.expect_rest(b"s")?;
            Err(Abort::Error("CLIENT_ERROR not implemented\r\n"))
        }
        b"stat" => {
            s.expect_rest(b"s")?;
            s.eol()?;
            Ok(ParsedCommand::Reply("END\r\n"))
        }
        b"flus" => {
            s.expect_rest(b"h_all")?;
            flush_fields(s)
        }
        b"vers" => {
            s.expect_rest(b"ion")?;
            s.eol()?;
            Ok(ParsedCommand::Reply(VERSION_REPLY))
        }
        b"verb" => {
            s.expect_rest(b"osity")?;
            verbosity_fields(s)
        }
        b"quit" => {
            s.eol()?;
            Ok(ParsedCommand::Quit)
        }
        _ => Err(Abort::Error("ERROR\r\n")),
    }
}

fn get_fields(s: &mut Scanner<'_>, with_cas: bool) -> PResult<ParsedCommand> {
    let mut keys = Vec::new();
    loop {
        match s.token(keys.is_empty())? {
            Some(token) => keys.push(Bytes::copy_from_slice(token)),
            None => break,
        }
    }
    s.eol()?;
    Ok(ParsedCommand::Get { keys, with_cas })
}

fn store_fields(s: &mut Scanner<'_>, kind: StoreKind) -> PResult<ParsedCommand> {
    let key = Bytes::copy_from_slice(s.token(true)?.expect("required token"));
    let flags = s.parse_u32()?;
    let exptime = s.parse_u32()?;
    let nbytes = s.parse_u32()?;
    let noreply = s.noreply()?;
    s.eol()?;
    let data = s.data(nbytes as usize)?;
    Ok(ParsedCommand::Store {
        kind,
        key,
        flags,
        exptime,
        data,
        noreply,
    })
}

fn cas_fields(s: &mut Scanner<'_>) -> PResult<ParsedCommand> {
    let key = Bytes::copy_from_slice(s.token(true)?.expect("required token"));
    let flags = s.parse_u32()?;
    let exptime = s.parse_u32()?;
    let nbytes = s.parse_u32()?;
    let stamp = s.parse_u64()?;
    let noreply = s.noreply()?;
    s.eol()?;
    let data = s.data(nbytes as usize)?;
    Ok(ParsedCommand::Cas {
        key,
        flags,
        exptime,
        data,
        stamp,
        noreply,
    })
}

fn arith_fields(s: &mut Scanner<'_>, decr: bool) -> PResult<ParsedCommand> {
    let key = Bytes::copy_from_slice(s.token(true)?.expect("required token"));
    let delta = s.parse_u64()?;
    let noreply = s.noreply()?;
    s.eol()?;
    Ok(ParsedCommand::Arith {
        decr,
        key,
        delta,
        noreply,
    })
}

fn delete_fields(s: &mut Scanner<'_>) -> PResult<ParsedCommand> {
    let key = Bytes::copy_from_slice(s.token(true)?.expect("required token"));
    let noreply = s.noreply()?;
    s.eol()?;
    Ok(ParsedCommand::Delete { key, noreply })
}

fn touch_fields(s: &mut Scanner<'_>) -> PResult<ParsedCommand> {
    let key = Bytes::copy_from_slice(s.token(true)?.expect("required token"));
    let exptime = s.parse_u32()?;
    let noreply = s.noreply()?;
    s.eol()?;
    Ok(ParsedCommand::Touch {
        key,
        exptime,
        noreply,
    })
}

fn flush_fields(s: &mut Scanner<'_>) -> PResult<ParsedCommand> {
    match s.token(false)? {
        None => {
            s.eol()?;
            Ok(ParsedCommand::FlushAll {
                delay: 0,
                noreply: false,
            })
        }
        Some(token) if token == b"noreply" => {
            s.eol()?;
            Ok(ParsedCommand::FlushAll {
                delay: 0,
                noreply: true,
            })
        }
        Some(token) => {
            let delay = digits_u64(token)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(Abort::Error("CLIENT_ERROR invalid number parameter\r\n"))?;
            let noreply = s.noreply()?;
            s.eol()?;
            Ok(ParsedCommand::FlushAll { delay, noreply })
        }
    }
}

fn verbosity_fields(s: &mut Scanner<'_>) -> PResult<ParsedCommand> {
    let level = s.parse_u32()?;
    let noreply = s.noreply()?;
    s.eol()?;
    Ok(ParsedCommand::Verbosity { level, noreply })
}
