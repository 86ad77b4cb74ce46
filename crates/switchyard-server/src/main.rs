//! Switchyard server binary.
//!
//! # Usage
//!
//! ```bash
//! # Single instance, in-memory store (development)
//! SWITCHYARD_JWT_SECRET=dev switchyard-server --bind 0.0.0.0:8080
//!
//! # Durable call records
//! switchyard-server --jwt-secret "$SECRET" --store /var/lib/switchyard/hub.redb
//!
//! # Several instances behind a load balancer, sharing one Redis
//! switchyard-server --jwt-secret "$SECRET" --redis-url redis://10.0.0.5:6379
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use switchyard_server::{HubConfig, RegistryLimits, Server, ServerRuntimeConfig, StoreBackend, TransportConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Switchyard real-time hub
#[derive(Parser, Debug)]
#[command(name = "switchyard-server")]
#[command(about = "Real-time chat and call signaling hub")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// HS256 secret used to verify bearer tokens
    #[arg(long, env = "SWITCHYARD_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Path to a redb database for call records (in-memory if omitted)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Redis URL shared by every instance; enables cross-instance fan-out
    #[arg(long, env = "SWITCHYARD_REDIS_URL", conflicts_with = "store", hide_env_values = true)]
    redis_url: Option<String>,

    /// Browser origins allowed to connect (repeatable; any if omitted)
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// Seconds a single WebSocket write may take before the peer is dropped
    #[arg(long, default_value = "10")]
    write_timeout_secs: u64,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Switchyard server starting");
    tracing::info!("Binding to {}", args.bind);

    let store = match (args.redis_url, args.store) {
        (Some(url), _) => StoreBackend::Redis(url),
        (None, Some(path)) => {
            tracing::info!("Using a local store, fan-out stays within this process");
            StoreBackend::Redb(path)
        },
        (None, None) => {
            tracing::warn!("No --store or --redis-url given, call records will not survive a restart");
            StoreBackend::Memory
        },
    };

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        jwt_secret: args.jwt_secret,
        store,
        transport: TransportConfig {
            write_timeout: Duration::from_secs(args.write_timeout_secs),
            allowed_origins: args.allowed_origins,
        },
        hub: HubConfig {
            limits: RegistryLimits { max_connections: args.max_connections, ..Default::default() },
            ..Default::default()
        },
    };

    let server = Server::bind(config).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
