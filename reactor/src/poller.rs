//! Thin wrapper over the kernel readiness multiplexer.

use std::collections::HashSet;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::Error;
use crate::ready::Ready;

const EVENT_CAPACITY: usize = 1024;

/// epoll-backed readiness multiplexer.
///
/// The poller holds no ownership of channels; it tracks only which
/// descriptors are currently registered. Client channels are registered
/// `EPOLLONESHOT` so a reported event disarms the descriptor until the
/// owning loop re-arms it, which bounds readiness delivery to one
/// outstanding event per descriptor.
pub struct Poller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    registered: HashSet<RawFd>,
}

impl Poller {
    pub fn new() -> Result<Self, Error> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Poller {
            epfd,
            events: Vec::with_capacity(EVENT_CAPACITY),
            registered: HashSet::new(),
        })
    }

    /// Register a channel for its current interest mask.
    pub fn add(&mut self, channel: &Channel) -> Result<(), Error> {
        let fd = channel.fd();
        if self.registered.contains(&fd) {
            return Err(Error::ChannelAlreadyRegistered(fd));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, Self::epoll_mask(channel))?;
        self.registered.insert(fd);
        Ok(())
    }

    /// Re-program the kernel with the channel's current interest mask.
    ///
    /// For one-shot channels this is also the re-arm operation after a
    /// delivered event.
    pub fn modify(&mut self, channel: &Channel) -> Result<(), Error> {
        let fd = channel.fd();
        if !self.registered.contains(&fd) {
            return Err(Error::ChannelNotRegistered(fd));
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, Self::epoll_mask(channel))?;
        Ok(())
    }

    /// Remove a descriptor. Removing an unknown descriptor is a no-op.
    pub fn remove(&mut self, fd: RawFd) -> Result<(), Error> {
        if !self.registered.remove(&fd) {
            return Ok(());
        }
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // The kernel drops registrations when the descriptor closes;
            // a racing close is not an error here.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(Error::Io(err));
            }
        }
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registered.contains(&fd)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Block up to `timeout` for readiness and append `(fd, ready)` pairs
    /// to `out`. Returns the number of descriptors reported. An
    /// interrupted wait reports zero descriptors.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<(RawFd, Ready)>,
    ) -> Result<usize, Error> {
        let timeout_ms = match timeout {
            // Round up so a sub-millisecond deadline does not spin.
            Some(t) => t.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32,
            None => -1,
        };

        self.events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                EVENT_CAPACITY as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        unsafe { self.events.set_len(n as usize) };

        for ev in &self.events {
            let fd = ev.u64 as RawFd;
            let ready = Ready::from_epoll(ev.events);
            if !ready.is_empty() {
                out.push((fd, ready));
            }
        }
        Ok(n as usize)
    }

    fn epoll_mask(channel: &Channel) -> u32 {
        let interest = channel.interest();
        let mut mask = 0u32;
        if interest.is_readable() {
            mask |= libc::EPOLLIN as u32 | libc::EPOLLPRI as u32;
        }
        if interest.is_writable() {
            mask |= libc::EPOLLOUT as u32;
        }
        if !channel.is_infrastructure() {
            mask |= libc::EPOLLRDHUP as u32 | libc::EPOLLONESHOT as u32;
        }
        mask
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> Result<(), Error> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
