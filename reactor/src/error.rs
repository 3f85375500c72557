use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// Errors returned by the reactor.
#[derive(Debug)]
pub enum Error {
    /// epoll, timerfd, or eventfd syscall failed.
    Io(io::Error),
    /// A channel was added twice without being removed in between.
    ChannelAlreadyRegistered(RawFd),
    /// A channel was modified while not registered with the poller.
    ChannelNotRegistered(RawFd),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::ChannelAlreadyRegistered(fd) => {
                write!(f, "channel for fd {fd} is already registered")
            }
            Error::ChannelNotRegistered(fd) => {
                write!(f, "channel for fd {fd} is not registered")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
