//! In-memory registry server
//!
//! Run with: cargo run -p distribution --example basic_server
//!
//! Then push to it with any OCI client, e.g.
//! `crane copy alpine:latest localhost:5000/library/alpine:latest`.

use distribution::RegistryBuilder;
use storage::MemoryStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let storage = MemoryStorage::with_buckets(&["registry"]);

    let app = RegistryBuilder::new()
        .storage(storage.into())
        .bucket("registry")
        .build();

    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Registry listening on http://{}", addr);
    tracing::info!("Try: curl -i http://{}/v2/", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
