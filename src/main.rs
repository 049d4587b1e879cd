use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cronlock::config::Config;
use cronlock::lock::{LeaseStore, RedisLeaseStore};
use cronlock::scheduler::Scheduler;
use cronlock::shutdown::install_shutdown_handler;

const STORE_PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "cronlock", version)]
#[command(about = "Distributed cron scheduler with Redis-leased job locks")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "cronlock.yaml")]
    config: String,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %args.config, error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if args.validate {
        println!("configuration OK: {} job(s)", config.jobs.len());
        return;
    }

    let node_id = if config.node.id.is_empty() {
        let id = generate_node_id();
        tracing::info!(node_id = %id, "generated node ID");
        id
    } else {
        config.node.id.clone()
    };

    let store = match RedisLeaseStore::connect(&config.redis, &node_id).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, address = %config.redis.address, "failed to connect to Redis");
            std::process::exit(1);
        }
    };
    match tokio::time::timeout(STORE_PING_TIMEOUT, store.ping()).await {
        Ok(Ok(())) => {
            tracing::info!(address = %config.redis.address, "connected to Redis");
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, address = %config.redis.address, "failed to connect to Redis");
            std::process::exit(1);
        }
        Err(_) => {
            tracing::error!(address = %config.redis.address, "timed out connecting to Redis");
            std::process::exit(1);
        }
    }

    let store: Arc<dyn LeaseStore> = Arc::new(store);
    let scheduler = Scheduler::new(store, &config.node);

    for job in config.jobs {
        let name = job.name.clone();
        if let Err(e) = scheduler.add_job(job) {
            tracing::error!(job = %name, error = %e, "failed to add job");
            std::process::exit(1);
        }
    }

    scheduler.start();

    let shutdown = install_shutdown_handler();
    shutdown.cancelled().await;

    scheduler.stop().await;
    tracing::info!("shutdown complete");
}

/// `<hostname>-<8 hex chars>`, used when `node.id` is not configured.
fn generate_node_id() -> String {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{hostname}-{}", &nonce[..8])
}
