use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;

use galena_generator::stratifier::send_proc;
use galena_generator::tracing::{self, prelude::*};
use galena_generator::Config;

/// Pool work generator: serves block templates from bitcoind, or proxies an
/// upstream stratum pool.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Force proxy mode regardless of the configuration file
    #[arg(long)]
    proxy: bool,
}

#[tokio::main]
async fn main() {
    tracing::init();
    let cli = Cli::parse();

    let mut config = match Config::load_from(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            process::exit(1);
        }
    };
    if cli.proxy {
        config.proxy = true;
    }

    let running = CancellationToken::new();
    {
        let running = running.clone();
        tokio::spawn(async move {
            let mut sigint = unix::signal(SignalKind::interrupt()).unwrap();
            let mut sigterm = unix::signal(SignalKind::terminate()).unwrap();
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            trace!("Shutting down.");
            running.cancel();
        });
    }

    info!("Started.");
    let code = match galena_generator::run(&config, &running).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "generator failed");
            1
        }
    };

    info!(code, "generator exiting");
    if code != 0 {
        // Give the supervisor a chance to take the rest of the pool down
        // with us.
        send_proc(&config.sockets.supervisor, "shutdown").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    process::exit(code);
}
