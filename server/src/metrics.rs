//! Server metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "connections_closed",
    description = "Total number of connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "idle_timeouts",
    description = "Connections closed because their idle deadline expired"
)]
pub static IDLE_TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "accept_errors",
    description = "Accept attempts that failed, including descriptor exhaustion"
)]
pub static ACCEPT_ERRORS: Counter = Counter::new();

#[metric(name = "bytes_received", description = "Total bytes read from peers")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to peers")]
pub static BYTES_SENT: Counter = Counter::new();
