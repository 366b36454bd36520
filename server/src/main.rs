use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::watch;

use server::error::ServerError;
use server::orchestrator::run_server;
use server::settings::ServerSettings;
use server::store::MemoryStore;

/// Delay before a replacement hosting session starts after a fatal
/// worker error.
const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[clap(author, version, about = "Authoritative subspace session server")]
struct Args {
    /// Address both listeners bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Settings file; missing keys fall back to their defaults
    #[clap(short, long, default_value = "server_settings.txt")]
    settings: PathBuf,
    /// Override the configured TCP port
    #[clap(short, long)]
    port: Option<u16>,
    /// Override the configured player capacity
    #[clap(short, long)]
    max_players: Option<usize>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut settings = ServerSettings::load(&args.settings);
    if let Some(port) = args.port {
        if let Err(e) = settings.set("tcp_port", &port.to_string()) {
            warn!("ignoring --port override: {}", e);
        }
    }
    if let Some(max_players) = args.max_players {
        if let Err(e) = settings.set("max_players", &max_players.to_string()) {
            warn!("ignoring --max-players override: {}", e);
        }
    }
    let settings = Arc::new(StdMutex::new(settings));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = stop_tx.send(true);
        }
    });

    // Supervision: a fatal worker error tears the hosting session down
    // and a fresh one replaces it. Each session gets its own store.
    loop {
        let store = Box::new(MemoryStore::new());
        match run_server(Arc::clone(&settings), store, &args.host, stop_rx.clone()).await {
            Ok(()) => break,
            Err(ServerError::Fatal(reason)) => {
                error!(
                    "hosting session failed: {}; restarting in {}s",
                    reason,
                    RESTART_DELAY.as_secs()
                );
                tokio::time::sleep(RESTART_DELAY).await;
            }
            Err(e) => {
                error!("hosting session failed: {}", e);
                break;
            }
        }
        if *stop_rx.borrow() {
            break;
        }
    }
    info!("server exited");
}
