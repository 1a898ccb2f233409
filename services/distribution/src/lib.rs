//! # Container image registry
//!
//! A storage engine for the [distribution API](https://github.com/opencontainers/distribution-spec):
//! content-addressed blobs, resumable chunked uploads, manifests with
//! referential integrity against blobs, and tags resolved to digests.
//!
//! The engine is exposed in-process as [`Registry`], and over HTTP by the
//! router built with [`RegistryBuilder`].
//!
//! ## Example
//!
//! ```no_run
//! use distribution::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let app = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .build();
//!
//! // Serve `app` with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod blob_store;
mod config;
mod digest;
mod error;
mod layout;
mod locks;
mod manifest_store;
mod name;
mod registry;
mod schema;
mod upload;

pub use api::{DEFAULT_BODY_LIMIT, RegistryBuilder, router};
pub use blob_store::{BlobDescriptor, BlobReader, BlobStore};
pub use config::RegistryConfig;
pub use digest::{Algorithm, Digest, DigestWriter};
pub use error::{RegistryError, RegistryResult};
pub use manifest_store::{ManifestDocument, ManifestMetadata, ManifestPut, ManifestStore};
pub use name::{Reference, RepositoryName, Tag};
pub use registry::Registry;
pub use schema::{
    DOCKER_MANIFEST_LIST_V2, DOCKER_MANIFEST_V2, Descriptor, ImageManifest, Manifest,
    ManifestList, OCI_INDEX_V1, OCI_MANIFEST_V1, ParsedManifest, Platform, PlatformDescriptor,
};
pub use upload::{ContentRange, InitiateOutcome, MountRequest, UploadManager, UploadStatus};
