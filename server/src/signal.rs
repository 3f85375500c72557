//! Signal handling for graceful shutdown.

use reactor::LoopHandle;
use tracing::{info, warn};

/// Install a SIGINT/SIGTERM handler that shuts the loop down. A second
/// signal forces immediate exit.
pub fn install(handle: LoopHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if handle.is_shutdown() {
            warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        info!("received shutdown signal, stopping server");
        handle.shutdown();
    })
}
