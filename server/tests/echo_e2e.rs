//! End-to-end tests driving a real server with plain blocking clients.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use server::config::ServerConfig;
use server::{
    ConnectionHandler, MessageOutcome, ServerStatus, TcpConnection, TcpServer, WorkerPool,
};

/// Echo handler that counts its lifecycle hooks.
struct CountingEcho {
    connects: AtomicUsize,
    messages: AtomicUsize,
    closes: AtomicUsize,
}

impl CountingEcho {
    fn new() -> Arc<Self> {
        Arc::new(CountingEcho {
            connects: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }
}

impl ConnectionHandler for CountingEcho {
    fn on_connect(&self, _conn: &Arc<TcpConnection>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, conn: &Arc<TcpConnection>) -> MessageOutcome {
        let data = conn.with_input(|buf| buf.split());
        if data.is_empty() {
            return MessageOutcome::Partial;
        }
        self.messages.fetch_add(1, Ordering::SeqCst);
        conn.write(&data);
        MessageOutcome::Complete
    }

    fn on_close(&self, _conn: &Arc<TcpConnection>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestServer {
    addr: SocketAddr,
    handle: reactor::LoopHandle,
    status: ServerStatus,
    join: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> TestServer {
        let mut server_config = config;
        server_config.listen = "127.0.0.1:0".parse().unwrap();

        let pool = Arc::new(WorkerPool::new(2, "test-worker"));
        let mut server = TcpServer::bind(&server_config, pool, handler).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let status = server.status();

        let join = thread::spawn(move || {
            server.run().unwrap();
        });

        TestServer {
            addr,
            handle,
            status,
            join: Some(join),
        }
    }

    fn quick_cycles(mut config: ServerConfig) -> ServerConfig {
        config.cycle_interval_ms = 20;
        config
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn single_request_echoes_and_closes() {
    let handler = CountingEcho::new();
    let server = TestServer::start(
        TestServer::quick_cycles(ServerConfig::default()),
        handler.clone(),
    );

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.set_nodelay(true).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    client.write_all(b"0123456789abcdef").unwrap();

    let mut echoed = [0u8; 16];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"0123456789abcdef");

    // keep-alive is off: the server closes after the response drains.
    let mut rest = [0u8; 1];
    match client.read(&mut rest) {
        Ok(0) => {}
        other => panic!("expected server-side close, got {other:?}"),
    }

    assert!(wait_until(Duration::from_secs(2), || {
        server.status.active_connections() == 0
    }));
    assert_eq!(handler.connects.load(Ordering::SeqCst), 1);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 1);
    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn keep_alive_serves_multiple_requests_on_one_socket() {
    let handler = CountingEcho::new();
    let mut config = TestServer::quick_cycles(ServerConfig::default());
    config.keep_alive = true;
    config.idle_timeout_ms = 10_000;
    let server = TestServer::start(config, handler.clone());

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.set_nodelay(true).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    for round in 0..3u8 {
        let request = [round; 32];
        client.write_all(&request).unwrap();

        let mut response = [0u8; 32];
        client.read_exact(&mut response).unwrap();
        assert_eq!(response, request, "round {round} echoed wrong bytes");
    }

    assert_eq!(handler.connects.load(Ordering::SeqCst), 1);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 3);
    assert_eq!(handler.closes.load(Ordering::SeqCst), 0);
    assert_eq!(server.status.active_connections(), 1);

    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        handler.closes.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(server.status.active_connections(), 0);
}

#[test]
fn large_response_survives_partial_writes() {
    // Response far larger than any kernel send buffer, so the first send
    // pass cannot complete and the connection must come back on write
    // readiness at least once more.
    const SIZE: usize = 16 * 1024 * 1024;

    struct Firehose;
    impl ConnectionHandler for Firehose {
        fn on_message(&self, conn: &Arc<TcpConnection>) -> MessageOutcome {
            let request = conn.with_input(|buf| buf.split());
            if request.is_empty() {
                return MessageOutcome::Partial;
            }
            let mut payload = vec![0u8; SIZE];
            for (i, b) in payload.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            conn.write(&payload);
            MessageOutcome::Complete
        }
    }

    let mut config = TestServer::quick_cycles(ServerConfig::default());
    config.idle_timeout_ms = 30_000;
    let server = TestServer::start(config, Arc::new(Firehose));

    let mut client = TcpStream::connect(server.addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.write_all(b"go").unwrap();

    let mut received = Vec::with_capacity(SIZE);
    let mut chunk = [0u8; 64 * 1024];
    while received.len() < SIZE {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(e) => panic!("read failed after {} bytes: {e}", received.len()),
        }
    }

    assert_eq!(received.len(), SIZE);
    for (i, b) in received.iter().enumerate().step_by(4096) {
        assert_eq!(*b, (i % 251) as u8, "corruption at offset {i}");
    }
}

#[test]
fn abrupt_client_close_fires_on_close_once() {
    let handler = CountingEcho::new();
    let server = TestServer::start(
        TestServer::quick_cycles(ServerConfig::default()),
        handler.clone(),
    );

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.write_all(b"half a request").unwrap();
    // Force an RST rather than an orderly FIN.
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::from_secs(0)))
        .unwrap();
    drop(client);

    assert!(wait_until(Duration::from_secs(2), || {
        handler.closes.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    assert_eq!(server.status.active_connections(), 0);
}

#[test]
fn connect_close_churn_leaves_no_table_entries() {
    let handler = CountingEcho::new();
    let mut config = TestServer::quick_cycles(ServerConfig::default());
    config.idle_timeout_ms = 2_000;
    let server = TestServer::start(config, handler.clone());

    for _ in 0..200 {
        let client = TcpStream::connect(server.addr).unwrap();
        drop(client);
    }

    assert!(wait_until(Duration::from_secs(5), || {
        server.status.active_connections() == 0
    }));
    // Every accepted connection that reached the table was also closed.
    assert_eq!(
        handler.connects.load(Ordering::SeqCst),
        handler.closes.load(Ordering::SeqCst)
    );
}

#[test]
fn concurrent_clients_each_get_their_own_echo() {
    let handler = CountingEcho::new();
    let mut config = TestServer::quick_cycles(ServerConfig::default());
    config.idle_timeout_ms = 10_000;
    let server = TestServer::start(config, handler.clone());
    let addr = server.addr;

    let clients: Vec<_> = (0..16u8)
        .map(|i| {
            thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                client
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                let request = [i; 64];
                client.write_all(&request).unwrap();
                let mut response = [0u8; 64];
                client.read_exact(&mut response).unwrap();
                assert_eq!(response, request);
            })
        })
        .collect();

    for c in clients {
        c.join().unwrap();
    }
    assert_eq!(handler.messages.load(Ordering::SeqCst), 16);
}
