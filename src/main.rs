use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::gateway::GatewayServer;
use turnstile::quota::{resolve, Clock, SystemClock};
use turnstile::store::{AtomicStore, MemoryStore, RedisStore};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Per-client request quota gateway")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Turnstile quota gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        mode = %config.quota.mode,
        limit = config.quota.limit,
        window_secs = config.quota.window_secs,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn AtomicStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.store.url).await?),
        StoreBackend::Memory => {
            warn!("Using in-process store, quotas are not shared between instances");
            let store = MemoryStore::new(clock.clone());
            spawn_sweeper(store.clone(), config.store.sweep_interval_secs);
            Arc::new(store)
        }
    };

    let limiter = Arc::new(resolve(
        config.quota.mode,
        config.policy()?,
        config.store_timeout(),
        store,
        clock,
    ));

    let server = GatewayServer::from_config(&config, limiter)?;
    let listener = TcpListener::bind(config.server.listen_addr).await?;

    // Run the server with graceful shutdown on Ctrl+C
    server
        .serve_with_shutdown(listener, shutdown_signal())
        .await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Periodically drop expired records from the in-process store.
fn spawn_sweeper(store: MemoryStore, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
