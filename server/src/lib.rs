//! Reactor TCP server.
//!
//! One loop thread accepts connections and dispatches readiness; a worker
//! pool executes receive and send work off-loop. Higher-level protocols
//! plug in through the [`ConnectionHandler`] trait.

pub mod config;
pub mod connection;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod session;
pub mod signal;
pub mod sockops;
pub mod workers;

pub use config::Config;
pub use connection::{IoStatus, TcpConnection};
pub use server::{ConnectionHandler, MessageOutcome, ServerError, ServerStatus, TcpServer};
pub use session::{Session, SessionStore};
pub use workers::WorkerPool;
