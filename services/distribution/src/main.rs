//! # distribution-server
//!
//! Serves the registry over HTTP.
//!
//! ```toml
//! bind = "0.0.0.0:5000"
//! purge-interval-seconds = 300
//!
//! [storage.local]
//! path = "/var/lib/registry"
//!
//! [registry]
//! bucket = "registry"
//! upload-ttl-seconds = 86400
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use distribution::{Registry, RegistryConfig};
use serde::Deserialize;
use storage::StorageConfig;

#[derive(Debug, Parser)]
#[command(version, about = "Container image registry server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ServerConfig {
    #[serde(default = "default_bind")]
    bind: SocketAddr,

    #[serde(default = "default_purge_interval")]
    purge_interval_seconds: u64,

    #[serde(default)]
    storage: Option<StorageConfig>,

    #[serde(default)]
    registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            purge_interval_seconds: default_purge_interval(),
            storage: None,
            registry: RegistryConfig::default(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_purge_interval() -> u64 {
    300
}

fn load_config(path: Option<&Utf8PathBuf>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(ServerConfig::default());
    };

    let contents = std::fs::read_to_string(path)?;
    let config = toml_edit::de::from_str(&contents)?;
    tracing::debug!(%path, "loaded configuration");
    Ok(config)
}

/// Periodically discard upload sessions which have been idle past their TTL.
fn spawn_upload_purge(registry: Registry, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = registry.purge_expired_uploads(chrono::Utc::now()).await {
                tracing::warn!(error = %err, "failed to purge expired uploads");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let storage = match config.storage {
        Some(storage) => storage.build()?,
        None => {
            tracing::warn!("no storage configured, keeping registry content in memory");
            StorageConfig::Memory {
                bucket: config.registry.bucket.clone(),
            }
            .build()?
        }
    };
    tracing::info!(driver = storage.name(), bucket = %config.registry.bucket, "storage ready");

    let registry = Registry::new(&storage, &config.registry);
    spawn_upload_purge(
        registry.clone(),
        Duration::from_secs(config.purge_interval_seconds.max(1)),
    );

    let app = distribution::router(registry);

    let addr = args.bind.unwrap_or(config.bind);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Registry listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
