//! The TCP server: accept path, connection lifecycle, worker dispatch.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reactor::{Channel, EventLoop, Interest, LoopHandle, Timer};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{IoStatus, TcpConnection};
use crate::metrics::{
    ACCEPT_ERRORS, CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED, IDLE_TIMEOUTS,
};
use crate::sockops;
use crate::workers::WorkerPool;

/// What the handler made of the buffered input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A full message was consumed; the connection switches to write
    /// interest to flush the response.
    Complete,
    /// Input is incomplete; keep read interest and wait for more.
    Partial,
}

/// Hooks through which a protocol observes the connection lifecycle.
///
/// `on_connect` and `on_close` run on the loop thread; `on_message` runs
/// on a worker thread, with at most one invocation in flight per
/// connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, _conn: &Arc<TcpConnection>) {}

    fn on_message(&self, conn: &Arc<TcpConnection>) -> MessageOutcome;

    fn on_close(&self, _conn: &Arc<TcpConnection>) {}
}

/// Errors surfaced while bringing the server up or running it.
#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    Reactor(reactor::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
            ServerError::Reactor(e) => write!(f, "reactor error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            ServerError::Reactor(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<reactor::Error> for ServerError {
    fn from(e: reactor::Error) -> Self {
        ServerError::Reactor(e)
    }
}

/// Shared server state reachable from callbacks and worker tasks.
///
/// Callbacks capture weak references so the state (and the connections
/// it owns) can tear down while callbacks are still registered.
struct ServerInner {
    listener: TcpListener,
    connections: RwLock<HashMap<RawFd, Arc<TcpConnection>>>,
    pool: Arc<WorkerPool>,
    handler: Arc<dyn ConnectionHandler>,
    handle: LoopHandle,
    idle_timeout: Duration,
    keep_alive: bool,
    nodelay: bool,
    tcp_keepalive: bool,
}

/// Introspection handle that outlives the running server loop.
#[derive(Clone)]
pub struct ServerStatus {
    inner: Weak<ServerInner>,
}

impl ServerStatus {
    /// Connections currently held in the table.
    pub fn active_connections(&self) -> usize {
        self.inner
            .upgrade()
            .map(|inner| inner.connections.read().len())
            .unwrap_or(0)
    }
}

/// Reactor TCP server: one loop thread owns the listener, all channels
/// and all timers; workers own the byte shuffling.
pub struct TcpServer {
    inner: Arc<ServerInner>,
    event_loop: EventLoop,
    listen_channel: Arc<Channel>,
}

impl TcpServer {
    /// Bind the listener and wire the accept path. The worker pool and
    /// handler are passed in so tests can substitute their own.
    pub fn bind(
        config: &ServerConfig,
        pool: Arc<WorkerPool>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, ServerError> {
        let event_loop = EventLoop::new(config.cycle_interval())?;
        let listener = sockops::bind_listener(config.listen, config.backlog)?;

        let inner = Arc::new(ServerInner {
            listener,
            connections: RwLock::new(HashMap::new()),
            pool,
            handler,
            handle: event_loop.handle(),
            idle_timeout: config.idle_timeout(),
            keep_alive: config.keep_alive,
            nodelay: config.nodelay,
            tcp_keepalive: config.tcp_keepalive,
        });

        let listen_channel = Arc::new(Channel::infrastructure(
            inner.listener.as_raw_fd(),
            event_loop.handle(),
        ));
        listen_channel.set_interest(Interest::READABLE);
        let weak = Arc::downgrade(&inner);
        listen_channel.set_read_callback(move |el| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::accept_ready(&inner, el);
            }
        });

        Ok(TcpServer {
            inner,
            event_loop,
            listen_channel,
        })
    }

    /// The bound listener address (useful with a port of 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// Handle for stopping the loop or enqueueing loop work.
    pub fn handle(&self) -> LoopHandle {
        self.event_loop.handle()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register the listener and drive the loop on the calling thread
    /// until the handle requests shutdown, then close every remaining
    /// connection.
    pub fn run(&mut self) -> Result<(), ServerError> {
        self.event_loop.add_channel(&self.listen_channel)?;
        info!(
            listen = %self.local_addr()?,
            idle_timeout = ?self.inner.idle_timeout,
            "server listening"
        );

        self.event_loop.run()?;

        self.event_loop.remove_channel(&self.listen_channel);
        let remaining: Vec<_> = self.inner.connections.read().values().cloned().collect();
        for conn in remaining {
            ServerInner::close_connection(&self.inner, &mut self.event_loop, &conn);
        }
        info!("server stopped");
        Ok(())
    }
}

impl ServerInner {
    /// Accept every queued connection. Runs on the loop thread from the
    /// listen channel's read callback.
    fn accept_ready(inner: &Arc<ServerInner>, el: &mut EventLoop) {
        loop {
            match inner.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = Self::install(inner, el, stream, peer) {
                        ACCEPT_ERRORS.increment();
                        warn!(%peer, error = %e, "failed to install connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.raw_os_error() == Some(libc::EMFILE)
                        || e.raw_os_error() == Some(libc::ENFILE) =>
                {
                    // Descriptor exhaustion: leave the backlog queued and
                    // retry on the next readiness report.
                    ACCEPT_ERRORS.increment();
                    error!(error = %e, "accept failed: out of descriptors");
                    break;
                }
                Err(e) => {
                    ACCEPT_ERRORS.increment();
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn install(
        inner: &Arc<ServerInner>,
        el: &mut EventLoop,
        stream: std::net::TcpStream,
        peer: SocketAddr,
    ) -> io::Result<()> {
        sockops::prepare_stream(&stream, inner.nodelay, inner.tcp_keepalive)?;

        let conn = Arc::new(TcpConnection::new(stream, peer, inner.keep_alive));
        let fd = conn.fd();

        // The table holds the only strong reference; everything else
        // works through weak handles from here on.
        inner.connections.write().insert(fd, conn.clone());
        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();

        let channel = Arc::new(Channel::new(fd, el.handle()));
        channel.set_interest(Interest::READABLE);

        let (wi, wc) = (Arc::downgrade(inner), Arc::downgrade(&conn));
        channel.set_read_callback(move |el| {
            if let (Some(inner), Some(conn)) = (wi.upgrade(), wc.upgrade()) {
                ServerInner::read_ready(&inner, el, &conn);
            }
        });

        let (wi, wc) = (Arc::downgrade(inner), Arc::downgrade(&conn));
        channel.set_write_callback(move |el| {
            if let (Some(inner), Some(conn)) = (wi.upgrade(), wc.upgrade()) {
                ServerInner::write_ready(&inner, el, &conn);
            }
        });

        let (wi, wc) = (Arc::downgrade(inner), Arc::downgrade(&conn));
        channel.set_close_callback(move |el| {
            if let (Some(inner), Some(conn)) = (wi.upgrade(), wc.upgrade()) {
                ServerInner::close_connection(&inner, el, &conn);
            }
        });

        conn.set_channel(channel.clone());
        el.add_channel(&channel).map_err(|e| {
            inner.connections.write().remove(&fd);
            CONNECTIONS_ACTIVE.decrement();
            io::Error::other(e.to_string())
        })?;

        let (wi, wc) = (Arc::downgrade(inner), Arc::downgrade(&conn));
        el.add_timer(Timer::with_callback(
            fd,
            Instant::now() + inner.idle_timeout,
            move |el| {
                if let (Some(inner), Some(conn)) = (wi.upgrade(), wc.upgrade()) {
                    IDLE_TIMEOUTS.increment();
                    debug!(fd = conn.fd(), peer = %conn.peer_addr(), "idle deadline expired");
                    ServerInner::close_connection(&inner, el, &conn);
                }
            },
        ));

        debug!(fd, %peer, "connection accepted");
        inner.handler.on_connect(&conn);
        Ok(())
    }

    /// Read readiness for a client. The one-shot registration has already
    /// disarmed the descriptor, so no second read event can arrive until
    /// the worker's completion path re-arms the channel.
    fn read_ready(inner: &Arc<ServerInner>, el: &mut EventLoop, conn: &Arc<TcpConnection>) {
        if conn.is_disconnected() {
            return;
        }
        el.adjust_timer(Timer::new(conn.fd(), Instant::now() + inner.idle_timeout));

        let (wi, wc) = (Arc::downgrade(inner), Arc::downgrade(conn));
        inner.pool.submit(move || Self::recv_task(wi, wc));
    }

    fn write_ready(inner: &Arc<ServerInner>, el: &mut EventLoop, conn: &Arc<TcpConnection>) {
        if conn.is_disconnected() {
            return;
        }
        el.adjust_timer(Timer::new(conn.fd(), Instant::now() + inner.idle_timeout));

        let (wi, wc) = (Arc::downgrade(inner), Arc::downgrade(conn));
        inner.pool.submit(move || Self::send_task(wi, wc));
    }

    /// Worker task: pull bytes, hand them to the handler, then swap the
    /// channel interest according to the handler's verdict.
    fn recv_task(wi: Weak<ServerInner>, wc: Weak<TcpConnection>) {
        let (Some(inner), Some(conn)) = (wi.upgrade(), wc.upgrade()) else {
            return;
        };
        if conn.is_disconnected() {
            return;
        }

        match conn.recv() {
            IoStatus::Closed | IoStatus::Error => {
                Self::request_close(&inner, &conn);
                return;
            }
            IoStatus::Ok | IoStatus::Again | IoStatus::Completed => {}
        }

        let interest = match inner.handler.on_message(&conn) {
            MessageOutcome::Partial => Interest::READABLE,
            MessageOutcome::Complete => Interest::WRITABLE,
        };
        Self::rearm(&conn, interest);
    }

    /// Worker task: flush the outbound buffer and decide what comes next.
    fn send_task(wi: Weak<ServerInner>, wc: Weak<TcpConnection>) {
        let (Some(inner), Some(conn)) = (wi.upgrade(), wc.upgrade()) else {
            return;
        };
        if conn.is_disconnected() {
            return;
        }

        match conn.send() {
            IoStatus::Completed => {
                if conn.is_keep_alive() {
                    Self::rearm(&conn, Interest::READABLE);
                } else {
                    Self::request_close(&inner, &conn);
                }
            }
            IoStatus::Again => Self::rearm(&conn, Interest::WRITABLE),
            IoStatus::Closed | IoStatus::Error => Self::request_close(&inner, &conn),
            IoStatus::Ok => {}
        }
    }

    /// Swap the channel's interest and re-arm its registration through
    /// the loop. The loop is the only thread that touches the poller, so
    /// the update is trampolined even though the interest mask itself is
    /// written here.
    fn rearm(conn: &Arc<TcpConnection>, interest: Interest) {
        let Some(channel) = conn.channel() else {
            return;
        };
        channel.set_interest(interest);

        let wc = Arc::downgrade(conn);
        channel.loop_handle().run_in_loop(move |el| {
            let Some(conn) = wc.upgrade() else {
                return;
            };
            if conn.is_disconnected() {
                return;
            }
            if let Some(channel) = conn.channel() {
                if let Err(e) = el.update_channel(&channel) {
                    warn!(fd = conn.fd(), error = %e, "failed to re-arm channel");
                }
            }
        });
    }

    /// Ask the loop to close a connection. Used by workers, which must
    /// not mutate loop state themselves.
    fn request_close(inner: &Arc<ServerInner>, conn: &Arc<TcpConnection>) {
        let (wi, wc) = (Arc::downgrade(inner), Arc::downgrade(conn));
        inner.handle.run_in_loop(move |el| {
            if let (Some(inner), Some(conn)) = (wi.upgrade(), wc.upgrade()) {
                ServerInner::close_connection(&inner, el, &conn);
            }
        });
    }

    /// Tear a connection down. Runs on the loop thread; the disconnected
    /// flag makes it idempotent, so coalesced close triggers (peer reset
    /// plus write readiness in one cycle, timer expiry racing a worker)
    /// collapse into one teardown.
    fn close_connection(inner: &Arc<ServerInner>, el: &mut EventLoop, conn: &Arc<TcpConnection>) {
        if conn.mark_disconnected() {
            return;
        }

        inner.handler.on_close(conn);

        if let Some(channel) = conn.take_channel() {
            el.remove_channel(&channel);
        }

        let fd = conn.fd();
        let removed = inner.connections.write().remove(&fd);
        el.remove_timer(fd);

        if removed.is_some() {
            CONNECTIONS_CLOSED.increment();
            CONNECTIONS_ACTIVE.decrement();
        }
        debug!(fd, peer = %conn.peer_addr(), "connection closed");
    }
}
