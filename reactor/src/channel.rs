//! Binding of one file descriptor to interest events and callbacks.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event_loop::{EventLoop, LoopHandle};
use crate::ready::{Interest, Ready};

/// Callback invoked by the owning loop when a subscribed readiness
/// condition is reported for the channel's descriptor.
pub type EventCallback = Arc<dyn Fn(&mut EventLoop) + Send + Sync>;

/// Binds one file descriptor to a set of interest events and up to three
/// readiness callbacks.
///
/// A channel does not own its descriptor: the owner is whatever owns the
/// underlying socket (or the event loop itself for its internal
/// descriptors). A channel is registered with at most one poller at a
/// time.
///
/// Infrastructure channels (listener, timer and wakeup descriptors) stay
/// armed across poll rounds. Client channels are registered one-shot: a
/// reported event disables the descriptor until the channel is updated
/// again, so at most one readiness event per descriptor is outstanding.
pub struct Channel {
    fd: RawFd,
    infrastructure: bool,
    interest: AtomicU8,
    ready: AtomicU8,
    handle: LoopHandle,
    read_cb: Mutex<Option<EventCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    close_cb: Mutex<Option<EventCallback>>,
}

impl Channel {
    /// Create a channel for a client descriptor (one-shot registration).
    pub fn new(fd: RawFd, handle: LoopHandle) -> Self {
        Self::with_mode(fd, handle, false)
    }

    /// Create a channel for an infrastructure descriptor (listener, timer,
    /// wakeup): registration is persistent.
    pub fn infrastructure(fd: RawFd, handle: LoopHandle) -> Self {
        Self::with_mode(fd, handle, true)
    }

    fn with_mode(fd: RawFd, handle: LoopHandle, infrastructure: bool) -> Self {
        Channel {
            fd,
            infrastructure,
            interest: AtomicU8::new(Interest::NONE.bits()),
            ready: AtomicU8::new(Ready::EMPTY.bits()),
            handle,
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_infrastructure(&self) -> bool {
        self.infrastructure
    }

    /// Handle to the loop this channel belongs to.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Replace the interest mask. Takes effect at the next add or update
    /// of the channel with its loop.
    pub fn set_interest(&self, interest: Interest) {
        self.interest.store(interest.bits(), Ordering::Release);
    }

    pub fn interest(&self) -> Interest {
        Interest::from_bits(self.interest.load(Ordering::Acquire))
    }

    /// Readiness reported by the most recent dispatch.
    pub fn last_ready(&self) -> Ready {
        Ready::from_bits(self.ready.load(Ordering::Acquire))
    }

    pub fn set_read_callback(&self, cb: impl Fn(&mut EventLoop) + Send + Sync + 'static) {
        *self.read_cb.lock() = Some(Arc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn(&mut EventLoop) + Send + Sync + 'static) {
        *self.write_cb.lock() = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn(&mut EventLoop) + Send + Sync + 'static) {
        *self.close_cb.lock() = Some(Arc::new(cb));
    }

    /// Route reported readiness to the bound callbacks. Called only by the
    /// owning loop, on the loop thread.
    ///
    /// Ordering within one dispatch is read, then write, then close, so
    /// buffered input is drained before a hangup collapses the
    /// connection. A hangup that arrives together with readable data does
    /// not fire the close callback here: the read path will observe the
    /// peer close itself.
    pub fn dispatch(&self, ready: Ready, event_loop: &mut EventLoop) {
        self.ready.store(ready.bits(), Ordering::Release);

        let fire_close = ready.is_error() || (ready.is_hangup() && !ready.is_readable());

        if ready.is_readable() || ready.is_priority() {
            if let Some(cb) = self.read_cb.lock().clone() {
                cb(event_loop);
            }
        }
        if ready.is_writable() {
            if let Some(cb) = self.write_cb.lock().clone() {
                cb(event_loop);
            }
        }
        if fire_close {
            if let Some(cb) = self.close_cb.lock().clone() {
                cb(event_loop);
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("infrastructure", &self.infrastructure)
            .field("interest", &self.interest())
            .field("last_ready", &self.last_ready())
            .finish()
    }
}
