//! Echo server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use server::config::Config;
use server::{logging, signal};
use server::{ConnectionHandler, MessageOutcome, TcpConnection, TcpServer, WorkerPool};

#[derive(Parser)]
#[command(name = "echo")]
#[command(about = "Reactor echo server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Override the listen address from the config file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// Echoes every received buffer back to the peer.
struct Echo;

impl ConnectionHandler for Echo {
    fn on_message(&self, conn: &Arc<TcpConnection>) -> MessageOutcome {
        let data = conn.with_input(|buf| buf.split());
        if data.is_empty() {
            return MessageOutcome::Partial;
        }
        conn.write(&data);
        MessageOutcome::Complete
    }
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let pool = Arc::new(WorkerPool::new(config.workers.threads, "worker"));
    let mut server = TcpServer::bind(&config.server, pool, Arc::new(Echo))?;

    signal::install(server.handle())?;

    server.run()?;
    Ok(())
}

fn print_default_config() {
    let config = r#"# Echo server configuration

[server]
# Address the listener binds to
listen = "127.0.0.1:7700"

# TCP listen backlog
backlog = 1024

# Per-connection idle deadline in milliseconds; expiry closes the connection
idle_timeout_ms = 5000

# Upper bound on one loop cycle's poll wait, in milliseconds
cycle_interval_ms = 1000

# Whether connections stay open after a completed response
keep_alive = false

# Set TCP_NODELAY on accepted connections
nodelay = true

# Set SO_KEEPALIVE on accepted connections
tcp_keepalive = false

[workers]
# Number of worker threads (0 = number of CPUs)
threads = 0

[logging]
# Log level: trace, debug, info, warn, error (RUST_LOG overrides)
level = "info"

# Output format: "pretty", "compact", or "json"
format = "pretty"
"#;
    print!("{config}");
}
