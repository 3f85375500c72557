//! Idle-deadline behavior: silent connections are closed from the timer
//! path, active connections have their deadline extended.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use server::config::ServerConfig;
use server::{ConnectionHandler, MessageOutcome, TcpConnection, TcpServer, WorkerPool};

struct Echo {
    closes: AtomicUsize,
}

impl ConnectionHandler for Echo {
    fn on_message(&self, conn: &Arc<TcpConnection>) -> MessageOutcome {
        let data = conn.with_input(|buf| buf.split());
        if data.is_empty() {
            return MessageOutcome::Partial;
        }
        conn.write(&data);
        MessageOutcome::Complete
    }

    fn on_close(&self, _conn: &Arc<TcpConnection>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn start(idle_timeout_ms: u64, keep_alive: bool) -> (std::net::SocketAddr, Arc<Echo>, impl Drop) {
    let handler = Arc::new(Echo {
        closes: AtomicUsize::new(0),
    });

    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        idle_timeout_ms,
        cycle_interval_ms: 20,
        keep_alive,
        ..ServerConfig::default()
    };

    let pool = Arc::new(WorkerPool::new(2, "idle-worker"));
    let mut server = TcpServer::bind(&config, pool, handler.clone()).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();

    let join = thread::spawn(move || {
        server.run().unwrap();
    });

    struct Guard {
        handle: reactor::LoopHandle,
        join: Option<thread::JoinHandle<()>>,
    }
    impl Drop for Guard {
        fn drop(&mut self) {
            self.handle.shutdown();
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }

    (
        addr,
        handler,
        Guard {
            handle,
            join: Some(join),
        },
    )
}

#[test]
fn silent_connection_is_closed_at_the_deadline() {
    let (addr, handler, _guard) = start(500, false);

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let started = Instant::now();
    let mut buf = [0u8; 1];
    // The server should close us from the timer path without any I/O.
    match client.read(&mut buf) {
        Ok(0) => {}
        other => panic!("expected idle close, got {other:?}"),
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(400),
        "closed too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(3),
        "closed too late: {elapsed:?}"
    );
    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn traffic_extends_the_deadline() {
    let (addr, handler, _guard) = start(600, true);

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // Keep the connection busy past several times the idle deadline.
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(1_800) {
        client.write_all(b"tick").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"tick");
        thread::sleep(Duration::from_millis(150));
    }
    assert_eq!(handler.closes.load(Ordering::SeqCst), 0);

    // Now go quiet and the deadline fires.
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) => {}
        other => panic!("expected idle close after going quiet, got {other:?}"),
    }
    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
}
