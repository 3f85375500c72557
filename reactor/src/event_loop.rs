//! The dispatch cycle that couples poller, timer queue and channels.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::error::Error;
use crate::poller::Poller;
use crate::ready::{Interest, Ready};
use crate::timer::{Timer, TimerQueue};

/// Work enqueued onto the loop from any thread. Runs on the loop thread
/// at the end of a dispatch cycle, after all poller-derived callbacks.
pub type LoopTask = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Counter descriptor that interrupts a blocked poll when another thread
/// posts work to the loop.
struct Waker(RawFd);

impl Waker {
    fn new() -> Result<Self, Error> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Waker(fd))
    }

    fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.0, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(self.0, &mut counter as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Cheaply cloneable handle for reaching a loop from other threads.
///
/// Channel and timer mutation must happen on the loop thread; callers on
/// other threads trampoline through [`LoopHandle::run_in_loop`], which
/// enqueues the task and wakes the loop.
#[derive(Clone)]
pub struct LoopHandle {
    tasks: Sender<LoopTask>,
    waker: Arc<Waker>,
    stopped: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Enqueue `task` to run on the loop thread at the end of a cycle.
    pub fn run_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        let _ = self.tasks.send(Box::new(task));
        self.waker.wake();
    }

    /// Ask the loop to exit its dispatch cycle.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Single-threaded event demultiplexer.
///
/// Owns one poller, one timer queue bound to a kernel timer descriptor,
/// a wakeup descriptor, and a non-owning registry of channels keyed by
/// descriptor. One dispatch cycle polls for readiness, routes events to
/// channel callbacks, runs expired timer callbacks, and finally drains
/// tasks enqueued through the handle.
pub struct EventLoop {
    poller: Poller,
    timers: TimerQueue,
    channels: HashMap<RawFd, Weak<Channel>>,
    tasks: Receiver<LoopTask>,
    handle: LoopHandle,
    timer_channel: Arc<Channel>,
    waker_channel: Arc<Channel>,
    cycle_interval: Duration,
    ready_buf: Vec<(RawFd, Ready)>,
    dispatch_buf: Vec<(Weak<Channel>, Ready)>,
}

impl EventLoop {
    /// `cycle_interval` bounds how long one poll may block when no timer
    /// is due sooner.
    pub fn new(cycle_interval: Duration) -> Result<Self, Error> {
        let poller = Poller::new()?;
        let timers = TimerQueue::new()?;
        let waker = Arc::new(Waker::new()?);
        let (tx, rx) = crossbeam_channel::unbounded();

        let handle = LoopHandle {
            tasks: tx,
            waker: waker.clone(),
            stopped: Arc::new(AtomicBool::new(false)),
        };

        let timer_channel = Arc::new(Channel::infrastructure(timers.fd(), handle.clone()));
        timer_channel.set_interest(Interest::READABLE);
        let waker_channel = Arc::new(Channel::infrastructure(waker.0, handle.clone()));
        waker_channel.set_interest(Interest::READABLE);

        let mut event_loop = EventLoop {
            poller,
            timers,
            channels: HashMap::new(),
            tasks: rx,
            handle,
            timer_channel,
            waker_channel,
            cycle_interval,
            ready_buf: Vec::with_capacity(64),
            dispatch_buf: Vec::with_capacity(64),
        };

        let timer_channel = event_loop.timer_channel.clone();
        let waker_channel = event_loop.waker_channel.clone();
        event_loop.add_channel(&timer_channel)?;
        event_loop.add_channel(&waker_channel)?;
        Ok(event_loop)
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Register a channel with the poller and the registry. Registering a
    /// descriptor twice is a programming error; it degrades to an update.
    pub fn add_channel(&mut self, channel: &Arc<Channel>) -> Result<(), Error> {
        match self.poller.add(channel) {
            Ok(()) => {}
            Err(Error::ChannelAlreadyRegistered(fd)) => {
                debug_assert!(false, "channel for fd {fd} registered twice");
                warn!(fd, "channel registered twice, updating instead");
                self.poller.modify(channel)?;
            }
            Err(e) => return Err(e),
        }
        self.channels.insert(channel.fd(), Arc::downgrade(channel));
        trace!(fd = channel.fd(), interest = ?channel.interest(), "channel added");
        Ok(())
    }

    /// Re-program a channel's registration from its current interest
    /// mask. For client channels this re-arms the one-shot registration.
    /// Updating an unregistered channel is a programming error; it
    /// degrades to an add.
    pub fn update_channel(&mut self, channel: &Arc<Channel>) -> Result<(), Error> {
        match self.poller.modify(channel) {
            Ok(()) => {
                self.channels
                    .entry(channel.fd())
                    .or_insert_with(|| Arc::downgrade(channel));
                Ok(())
            }
            Err(Error::ChannelNotRegistered(fd)) => {
                debug_assert!(false, "update of unregistered channel fd {fd}");
                warn!(fd, "update of unregistered channel, adding instead");
                self.add_channel(channel)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a channel from the poller and the registry. Idempotent.
    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        self.remove_channel_fd(channel.fd());
    }

    fn remove_channel_fd(&mut self, fd: RawFd) {
        self.channels.remove(&fd);
        if let Err(e) = self.poller.remove(fd) {
            warn!(fd, error = %e, "failed to remove channel from poller");
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn add_timer(&mut self, timer: Timer) {
        self.timers.push(timer);
    }

    pub fn adjust_timer(&mut self, timer: Timer) {
        self.timers.adjust(timer);
    }

    pub fn remove_timer(&mut self, id: RawFd) {
        self.timers.remove(id);
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Run the dispatch cycle until the handle requests shutdown. Blocks
    /// the calling thread, which becomes the loop thread.
    pub fn run(&mut self) -> Result<(), Error> {
        debug!(cycle_interval = ?self.cycle_interval, "event loop running");

        while !self.handle.is_shutdown() {
            let timeout = self.poll_timeout();

            let mut batch = std::mem::take(&mut self.ready_buf);
            batch.clear();
            self.poller.poll(Some(timeout), &mut batch)?;

            let mut dispatch = std::mem::take(&mut self.dispatch_buf);
            dispatch.clear();

            for &(fd, ready) in &batch {
                if fd == self.timer_channel.fd() {
                    self.expire_timers();
                } else if fd == self.waker_channel.fd() {
                    self.handle.waker.drain();
                } else if let Some(weak) = self.channels.get(&fd) {
                    dispatch.push((weak.clone(), ready));
                } else {
                    // Readiness for a descriptor that was removed earlier
                    // in this same batch; nothing to route.
                    trace!(fd, "readiness for unknown descriptor dropped");
                }
            }
            self.ready_buf = batch;

            for (weak, ready) in dispatch.drain(..) {
                match weak.upgrade() {
                    Some(channel) => channel.dispatch(ready, self),
                    None => {
                        // Owner dropped the channel without removing it.
                        debug!("channel dropped while registered");
                    }
                }
            }
            self.dispatch_buf = dispatch;

            self.run_pending_tasks();
        }

        debug!("event loop stopped");
        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        match self.timers.next_deadline() {
            Some(deadline) => self
                .cycle_interval
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.cycle_interval,
        }
    }

    fn expire_timers(&mut self) {
        for mut timer in self.timers.expire_due(Instant::now()) {
            if let Some(cb) = timer.callback.as_mut() {
                cb(self);
            }
        }
    }

    /// Tasks observed at entry run now; tasks enqueued by those tasks run
    /// next cycle, so a task that re-enqueues cannot starve the poller.
    fn run_pending_tasks(&mut self) {
        let pending = self.tasks.len();
        for _ in 0..pending {
            match self.tasks.try_recv() {
                Ok(task) => task(self),
                Err(_) => break,
            }
        }
    }
}
