//! Per-connection state.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use reactor::Channel;
use tracing::debug;

use crate::metrics::{BYTES_RECEIVED, BYTES_SENT};

const RECV_CHUNK: usize = 8 * 1024;

/// Outcome of one receive or send pass over a non-blocking socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Receive: bytes were appended to the inbound buffer.
    Ok,
    /// No progress possible right now; wait for the next readiness event.
    Again,
    /// Send: the outbound buffer drained completely.
    Completed,
    /// The peer closed its end.
    Closed,
    /// Unexpected socket failure; treated like a peer close by callers.
    Error,
}

impl IoStatus {
    fn from_u8(v: u8) -> IoStatus {
        match v {
            0 => IoStatus::Ok,
            1 => IoStatus::Again,
            2 => IoStatus::Completed,
            3 => IoStatus::Closed,
            _ => IoStatus::Error,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            IoStatus::Ok => 0,
            IoStatus::Again => 1,
            IoStatus::Completed => 2,
            IoStatus::Closed => 3,
            IoStatus::Error => 4,
        }
    }
}

struct Outbound {
    buf: BytesMut,
    pos: usize,
}

/// One accepted client connection.
///
/// The connection owns its socket and its channel; the server's
/// connection table is the sole strong owner of the connection itself.
/// Readiness callbacks and worker tasks hold weak handles that they
/// upgrade for the duration of one callback body.
///
/// Buffer mutation happens on worker threads, at most one task in flight
/// per connection. Once `disconnected` flips to true (it never flips
/// back), late workers return without touching the buffers.
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    channel: Mutex<Option<Arc<Channel>>>,
    inbound: Mutex<BytesMut>,
    outbound: Mutex<Outbound>,
    keep_alive: AtomicBool,
    disconnected: AtomicBool,
    last_io: AtomicU8,
}

impl TcpConnection {
    /// `stream` must already be non-blocking.
    pub fn new(stream: TcpStream, peer: SocketAddr, keep_alive: bool) -> Self {
        TcpConnection {
            stream,
            peer,
            channel: Mutex::new(None),
            inbound: Mutex::new(BytesMut::with_capacity(RECV_CHUNK)),
            outbound: Mutex::new(Outbound {
                buf: BytesMut::with_capacity(RECV_CHUNK),
                pos: 0,
            }),
            keep_alive: AtomicBool::new(keep_alive),
            disconnected: AtomicBool::new(false),
            last_io: AtomicU8::new(IoStatus::Again.as_u8()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn set_channel(&self, channel: Arc<Channel>) {
        *self.channel.lock() = Some(channel);
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().clone()
    }

    /// Detach and return the channel. Used by the close path so the
    /// channel drops once deregistration is done.
    pub fn take_channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().take()
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Flip the disconnected flag. Returns the previous value, so exactly
    /// one caller observes the transition.
    pub fn mark_disconnected(&self) -> bool {
        self.disconnected.swap(true, Ordering::AcqRel)
    }

    /// Outcome of the most recent receive or send pass.
    pub fn last_io(&self) -> IoStatus {
        IoStatus::from_u8(self.last_io.load(Ordering::Acquire))
    }

    /// Run `f` over the inbound buffer. Handlers consume parsed input
    /// here and leave incomplete input in place.
    pub fn with_input<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        f(&mut self.inbound.lock())
    }

    /// Number of buffered inbound bytes not yet consumed by the handler.
    pub fn input_len(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Queue bytes for transmission. Sent once the channel reports write
    /// readiness.
    pub fn write(&self, data: &[u8]) {
        let mut out = self.outbound.lock();
        out.buf.extend_from_slice(data);
    }

    /// Unsent outbound bytes.
    pub fn pending_output(&self) -> usize {
        let out = self.outbound.lock();
        out.buf.len() - out.pos
    }

    /// Pull bytes from the socket into the inbound buffer until the
    /// kernel has no more, a full pass at a time.
    pub fn recv(&self) -> IoStatus {
        if self.is_disconnected() {
            return self.finish(IoStatus::Closed);
        }

        let mut inbound = self.inbound.lock();
        let mut chunk = [0u8; RECV_CHUNK];
        let mut total = 0u64;

        loop {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    if total > 0 {
                        BYTES_RECEIVED.add(total);
                    }
                    return self.finish(IoStatus::Closed);
                }
                Ok(n) => {
                    inbound.extend_from_slice(&chunk[..n]);
                    total += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == std::io::ErrorKind::ConnectionReset
                        || e.kind() == std::io::ErrorKind::BrokenPipe =>
                {
                    return self.finish(IoStatus::Closed);
                }
                Err(e) => {
                    debug!(fd = self.fd(), peer = %self.peer, error = %e, "recv failed");
                    return self.finish(IoStatus::Error);
                }
            }
        }

        if total > 0 {
            BYTES_RECEIVED.add(total);
            self.finish(IoStatus::Ok)
        } else {
            self.finish(IoStatus::Again)
        }
    }

    /// Push buffered outbound bytes to the socket until the kernel buffer
    /// fills or the data runs out.
    pub fn send(&self) -> IoStatus {
        if self.is_disconnected() {
            return self.finish(IoStatus::Closed);
        }

        let mut out = self.outbound.lock();
        let mut total = 0u64;

        loop {
            if out.pos >= out.buf.len() {
                out.buf.clear();
                out.pos = 0;
                if total > 0 {
                    BYTES_SENT.add(total);
                }
                return self.finish(IoStatus::Completed);
            }

            match (&self.stream).write(&out.buf[out.pos..]) {
                Ok(0) => {
                    if total > 0 {
                        BYTES_SENT.add(total);
                    }
                    return self.finish(IoStatus::Closed);
                }
                Ok(n) => {
                    out.pos += n;
                    total += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if total > 0 {
                        BYTES_SENT.add(total);
                    }
                    return self.finish(IoStatus::Again);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == std::io::ErrorKind::ConnectionReset
                        || e.kind() == std::io::ErrorKind::BrokenPipe =>
                {
                    if total > 0 {
                        BYTES_SENT.add(total);
                    }
                    return self.finish(IoStatus::Closed);
                }
                Err(e) => {
                    debug!(fd = self.fd(), peer = %self.peer, error = %e, "send failed");
                    return self.finish(IoStatus::Error);
                }
            }
        }
    }

    fn finish(&self, status: IoStatus) -> IoStatus {
        self.last_io.store(status.as_u8(), Ordering::Release);
        status
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("fd", &self.fd())
            .field("peer", &self.peer)
            .field("keep_alive", &self.is_keep_alive())
            .field("disconnected", &self.is_disconnected())
            .field("last_io", &self.last_io())
            .finish()
    }
}
