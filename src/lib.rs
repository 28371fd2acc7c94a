//! Work generator for the galena pool daemon.
//!
//! The generator obtains mining work and normalizes it for the stratifier,
//! which distributes it to connected miners. It runs in one of two modes:
//!
//! - **Server mode** fetches block templates on demand from a local bitcoind
//!   over authenticated JSON-RPC.
//! - **Proxy mode** maintains a miner session against an upstream stratum
//!   pool, republishing its jobs and forwarding share submissions.
//!
//! Either way the interface to the rest of the pool is the same: a
//! Unix-domain control socket serving one request per connection, plus
//! fire-and-forget notification messages to the stratifier.

pub mod config;
pub mod control;
pub mod error;
pub mod node;
pub mod proxy;
pub mod server;
pub mod stratifier;
pub mod stratum;
pub mod tracing;

pub use config::Config;
pub use error::{Error, Result};

use control::ControlListener;
use stratifier::Stratifier;
use tokio_util::sync::CancellationToken;

/// Run the generator in the configured mode until shutdown.
pub async fn run(config: &Config, shutdown: &CancellationToken) -> Result<()> {
    let control = ControlListener::bind(&config.sockets.control)?;
    let stratifier = Stratifier::new(&config.sockets.stratifier);
    if config.proxy {
        proxy::run(config, &control, &stratifier, shutdown).await
    } else {
        server::run(config, &control, &stratifier, shutdown).await
    }
}
