//! Network layer: accept loops and per-socket suspension.
//!
//! Sockets are nonblocking and registered with the event backend once, at
//! creation. Read and write paths drain until `WouldBlock`, consume the
//! readiness flag, and park the task on the socket's [`IoState`]; the
//! primary core's listen call delivers the next edge and resumes the task
//! on whichever core owns the socket. Read suspension honors an optional
//! timeout surfaced as [`Error::Timeout`], a value rather than a fault.

use std::cell::Cell;
use std::future::Future;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::Token;

use crate::buffer::TxBuf;
use crate::clock;
use crate::core::Core;
use crate::event::{Backend, IoState};
use crate::task;
use crate::timeq::Timer;
use crate::Error;

/// Parked wait for input readiness, with an optional deadline.
struct ReadReady {
    state: Arc<IoState>,
    deadline_us: Option<u64>,
    timer_armed: bool,
}

impl Future for ReadReady {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if task::is_cancelled() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        let state = &self.state;
        if state.is_readable() || state.is_read_closed() || state.is_error() {
            return Poll::Ready(Ok(()));
        }
        if let Some(deadline) = self.deadline_us {
            if clock::monotonic_us() >= deadline {
                return Poll::Ready(Err(Error::Timeout));
            }
        }
        if self.state.park_reader(cx.waker()) {
            return Poll::Ready(Ok(()));
        }
        if let Some(deadline) = self.deadline_us {
            if !self.timer_armed {
                self.timer_armed = true;
                Core::current().add_timer(Timer {
                    expiry_us: deadline,
                    period_us: None,
                    waker: cx.waker().clone(),
                });
            }
        }
        Poll::Pending
    }
}

struct WriteReady {
    state: Arc<IoState>,
}

impl Future for WriteReady {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if task::is_cancelled() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        if self.state.is_writable() || self.state.is_error() {
            return Poll::Ready(Ok(()));
        }
        if self.state.park_writer(cx.waker()) {
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    }
}

/// A connected TCP socket owned by one core's tasks.
pub struct TcpConn {
    stream: TcpStream,
    token: Token,
    state: Arc<IoState>,
    backend: Arc<Backend>,
    read_timeout_us: Cell<Option<u64>>,
}

impl TcpConn {
    /// Register an accepted mio stream with the backend.
    pub fn from_mio(mut stream: TcpStream, backend: Arc<Backend>) -> io::Result<TcpConn> {
        let (token, state) = backend.register(&mut stream)?;
        Ok(TcpConn {
            stream,
            token,
            state,
            backend,
            read_timeout_us: Cell::new(None),
        })
    }

    pub fn from_std(stream: std::net::TcpStream, backend: Arc<Backend>) -> io::Result<TcpConn> {
        stream.set_nonblocking(true)?;
        Self::from_mio(TcpStream::from_std(stream), backend)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn set_read_timeout_us(&self, timeout: Option<u64>) {
        self.read_timeout_us.set(timeout);
    }

    fn read_deadline(&self) -> Option<u64> {
        self.read_timeout_us
            .get()
            .map(|t| clock::monotonic_us() + t)
    }

    /// Read available bytes into `buf`, suspending until at least one byte
    /// arrives. `Err(Closed)` reports an orderly peer hangup.
    pub async fn recv(&self, buf: &mut BytesMut) -> Result<usize, Error> {
        const MIN_SPARE: usize = 8 * 1024;
        let deadline = self.read_deadline();
        loop {
            self.state.clear_readable();
            let mut total = 0usize;
            loop {
                if buf.capacity() - buf.len() < MIN_SPARE {
                    buf.reserve(MIN_SPARE);
                }
                let spare = spare_capacity(buf);
                match (&self.stream).read(spare) {
                    Ok(0) => {
                        if total > 0 {
                            return Ok(total);
                        }
                        return Err(Error::Closed);
                    }
                    Ok(n) => {
                        // Safety: `read` initialized `n` bytes of the spare
                        // capacity slice returned above.
                        unsafe { buf.set_len(buf.len() + n) };
                        total += n;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if total > 0 {
                            return Ok(total);
                        }
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if total > 0 {
                            return Ok(total);
                        }
                        return Err(Error::Io(e));
                    }
                }
            }
            ReadReady {
                state: self.state.clone(),
                deadline_us: deadline,
                timer_armed: false,
            }
            .await?;
        }
    }

    /// Transmit the whole egress chain, suspending on backpressure.
    pub async fn send_buf(&self, tx: &mut TxBuf) -> Result<(), Error> {
        while !tx.is_empty() {
            self.state.clear_writable();
            let wrote = {
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(16);
                tx.io_slices(&mut slices, 16);
                (&self.stream).write_vectored(&slices)
            };
            match wrote {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => tx.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    WriteReady {
                        state: self.state.clone(),
                    }
                    .await?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Transmit a plain byte slice (admin replies, banners).
    pub async fn send_all(&self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            self.state.clear_writable();
            match (&self.stream).write(data) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => data = &data[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    WriteReady {
                        state: self.state.clone(),
                    }
                    .await?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        self.backend.deregister(&mut self.stream, self.token);
    }
}

/// A listening TCP socket driven by an accept-loop task.
pub struct TcpAcceptor {
    listener: TcpListener,
    token: Token,
    state: Arc<IoState>,
    backend: Arc<Backend>,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr, backend: Arc<Backend>) -> io::Result<TcpAcceptor> {
        let mut listener = TcpListener::bind(addr)?;
        let (token, state) = backend.register_read(&mut listener)?;
        Ok(TcpAcceptor {
            listener,
            token,
            state,
            backend,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one connection, suspending until a peer arrives.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), Error> {
        loop {
            if task::is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.state.clear_readable();
            match self.listener.accept() {
                Ok(pair) => return Ok(pair),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ReadReady {
                        state: self.state.clone(),
                        deadline_us: None,
                        timer_armed: false,
                    }
                    .await?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.backend.deregister(&mut self.listener, self.token);
    }
}

/// Unix-domain counterpart used by the admin command channel.
pub struct UnixAcceptor {
    listener: UnixListener,
    token: Token,
    state: Arc<IoState>,
    backend: Arc<Backend>,
}

impl UnixAcceptor {
    pub fn bind(path: &std::path::Path, backend: Arc<Backend>) -> io::Result<UnixAcceptor> {
        let mut listener = UnixListener::bind(path)?;
        let (token, state) = backend.register_read(&mut listener)?;
        Ok(UnixAcceptor {
            listener,
            token,
            state,
            backend,
        })
    }

    pub async fn accept(&self) -> Result<UnixConn, Error> {
        loop {
            if task::is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.state.clear_readable();
            match self.listener.accept() {
                Ok((stream, _addr)) => return Ok(UnixConn::from_mio(stream, self.backend.clone())?),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ReadReady {
                        state: self.state.clone(),
                        deadline_us: None,
                        timer_armed: false,
                    }
                    .await?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        self.backend.deregister(&mut self.listener, self.token);
    }
}

pub struct UnixConn {
    stream: UnixStream,
    token: Token,
    state: Arc<IoState>,
    backend: Arc<Backend>,
}

impl UnixConn {
    pub fn from_mio(mut stream: UnixStream, backend: Arc<Backend>) -> io::Result<UnixConn> {
        let (token, state) = backend.register(&mut stream)?;
        Ok(UnixConn {
            stream,
            token,
            state,
            backend,
        })
    }

    pub async fn recv(&self, buf: &mut BytesMut) -> Result<usize, Error> {
        const SPARE: usize = 1024;
        loop {
            self.state.clear_readable();
            if buf.capacity() - buf.len() < SPARE {
                buf.reserve(SPARE);
            }
            let spare = spare_capacity(buf);
            match (&self.stream).read(spare) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => {
                    // Safety: `read` initialized `n` bytes of spare capacity.
                    unsafe { buf.set_len(buf.len() + n) };
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ReadReady {
                        state: self.state.clone(),
                        deadline_us: None,
                        timer_armed: false,
                    }
                    .await?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    pub async fn send_all(&self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            self.state.clear_writable();
            match (&self.stream).write(data) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => data = &data[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    WriteReady {
                        state: self.state.clone(),
                    }
                    .await?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

impl Drop for UnixConn {
    fn drop(&mut self) {
        self.backend.deregister(&mut self.stream, self.token);
    }
}

/// View of a BytesMut's spare capacity as an initialized byte slice.
///
/// # Safety
/// The returned slice aliases uninitialized memory; callers must only write
/// through it and commit written bytes with `set_len`.
fn spare_capacity(buf: &mut BytesMut) -> &mut [u8] {
    let spare = buf.capacity() - buf.len();
    unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().add(buf.len()), spare) }
}
