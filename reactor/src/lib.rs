//! A single-threaded readiness event loop.
//!
//! The loop multiplexes many file descriptors over one epoll instance,
//! delivers deadline callbacks through a kernel timer descriptor, and
//! accepts work from other threads through an eventfd wakeup. Descriptors
//! are bound to the loop through [`Channel`]s, which carry the interest
//! mask and the readiness callbacks for one descriptor.

pub mod channel;
pub mod error;
pub mod event_loop;
pub mod poller;
pub mod ready;
pub mod timer;

pub use channel::{Channel, EventCallback};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle, LoopTask};
pub use poller::Poller;
pub use ready::{Interest, Ready};
pub use timer::{Timer, TimerQueue};
