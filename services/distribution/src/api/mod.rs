//! API server builder and router

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};

use crate::config::RegistryConfig;
use crate::registry::Registry;

mod handlers;
mod route;

/// Default cap on a single request body: one manifest, chunk or monolithic blob.
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024 * 1024;

/// Registry builder for configuring and creating the registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    config: RegistryConfig,
    body_limit: usize,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            config: RegistryConfig::default(),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.bucket = bucket.into();
        self
    }

    /// Replace the registry configuration
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the largest accepted request body, in bytes
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Build the in-process registry
    ///
    /// Without a configured storage backend, content is kept in memory.
    pub fn registry(&self) -> Registry {
        let storage = self.storage.clone().unwrap_or_else(|| {
            tracing::warn!("no storage backend configured, keeping registry content in memory");
            storage::MemoryStorage::with_buckets(&[self.config.bucket.as_str()]).into()
        });

        Registry::new(&storage, &self.config)
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        routes(self.registry(), self.body_limit)
    }
}

/// The distribution API router for an existing [`Registry`].
pub fn router(registry: Registry) -> Router {
    routes(registry, DEFAULT_BODY_LIMIT)
}

fn routes(registry: Registry, body_limit: usize) -> Router {
    Router::new()
        .route("/v2/", get(handlers::api_version_check))
        .route("/v2/{*path}", any(handlers::dispatch))
        .layer(axum::middleware::map_response(handlers::api_version_header))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(registry)
}
