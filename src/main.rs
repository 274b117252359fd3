use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use toolworld::config::Config;
use toolworld::runtime::Runtime;

/// Tool registry and dispatch bridge hosting a time-accelerated agent world
#[derive(Parser, Debug)]
#[command(name = "toolworld", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen on a TCP address instead of stdio (e.g. 127.0.0.1:7400)
    #[arg(short, long)]
    listen: Option<String>,

    /// Force stdio even if the configuration sets a listen address
    #[arg(long, conflicts_with = "listen")]
    stdio: bool,

    /// Initial time acceleration factor
    #[arg(short, long)]
    acceleration: Option<f64>,

    /// Tool configuration store file
    #[arg(long)]
    store_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the protocol, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(factor) = args.acceleration {
        config.simulation.acceleration = factor;
    }
    if let Some(path) = args.store_path {
        config.store.path = path;
    }
    if let Some(listen) = args.listen {
        config.server.listen = Some(listen);
    }
    if args.stdio {
        config.server.listen = None;
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        acceleration = config.simulation.acceleration,
        store = %config.store.path.display(),
        "starting toolworld"
    );

    let listen = config.server.listen.clone();
    let runtime = Runtime::build(config)?;
    if let Err(e) = runtime.import_upstream().await {
        warn!(error = %e, "continuing without upstream tools");
    }

    match listen {
        Some(addr) => {
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    let _ = stop_tx.send(true);
                }
            });
            if let Err(e) = runtime.run_tcp(&addr, stop_rx).await {
                error!(error = %e, "server failed");
                return Err(e.into());
            }
        }
        None => runtime.run_stdio().await?,
    }

    Ok(())
}
