//! In-process registry API
//!
//! [`Registry`] validates raw request parameters (names, references, digests,
//! session ids) and dispatches to the blob, upload and manifest stores. Every
//! method corresponds to one distribution API action.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncBufRead;
use uuid::Uuid;

use crate::blob_store::{BlobDescriptor, BlobReader, BlobStore};
use crate::config::RegistryConfig;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest_store::{ManifestDocument, ManifestMetadata, ManifestPut, ManifestStore};
use crate::name::{Reference, RepositoryName};
use crate::upload::{ContentRange, InitiateOutcome, MountRequest, UploadManager, UploadStatus};

/// The registry storage engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Registry {
    blobs: BlobStore,
    uploads: UploadManager,
    manifests: ManifestStore,
}

fn upload_id(id: &str) -> RegistryResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| RegistryError::upload_unknown(id))
}

impl Registry {
    /// Create a registry on `storage`, using the bucket named in `config`.
    pub fn new(storage: &storage::Storage, config: &RegistryConfig) -> Self {
        let bucket = storage.bucket(config.bucket.clone());
        let blobs = BlobStore::new(bucket.clone());
        let uploads = UploadManager::new(bucket.clone(), blobs.clone(), config.upload_ttl());
        let manifests = ManifestStore::new(bucket, blobs.clone());

        Self {
            blobs,
            uploads,
            manifests,
        }
    }

    /// Fetch a manifest by tag or digest.
    pub async fn get_manifest(&self, name: &str, reference: &str) -> RegistryResult<ManifestDocument> {
        let name: RepositoryName = name.parse()?;
        let reference: Reference = reference.parse()?;
        self.manifests.get(&name, &reference).await
    }

    /// Manifest metadata by tag or digest, without the document.
    pub async fn manifest_exists(
        &self,
        name: &str,
        reference: &str,
    ) -> RegistryResult<ManifestMetadata> {
        let name: RepositoryName = name.parse()?;
        let reference: Reference = reference.parse()?;
        self.manifests.exists(&name, &reference).await
    }

    /// Push a manifest under a tag or its own digest.
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        content_type: Option<&str>,
        content: Bytes,
    ) -> RegistryResult<ManifestPut> {
        let name: RepositoryName = name.parse()?;
        let reference: Reference = reference.parse()?;
        self.manifests
            .put(&name, &reference, content_type, content)
            .await
    }

    /// Delete a manifest, detaching any tags pointing at it.
    pub async fn delete_manifest(&self, name: &str, reference: &str) -> RegistryResult<Digest> {
        let name: RepositoryName = name.parse()?;
        let reference: Reference = reference.parse()?;
        self.manifests.delete(&name, &reference).await
    }

    /// Sorted tags of a repository.
    pub async fn list_tags(&self, name: &str) -> RegistryResult<Vec<String>> {
        let name: RepositoryName = name.parse()?;
        self.manifests.tags(&name).await
    }

    /// Check for a blob in a repository.
    pub async fn blob_exists(&self, name: &str, digest: &str) -> RegistryResult<BlobDescriptor> {
        let name: RepositoryName = name.parse()?;
        let digest: Digest = digest.parse()?;
        self.blobs.exists(&name, &digest).await
    }

    /// Open a blob for streaming.
    pub async fn get_blob(&self, name: &str, digest: &str) -> RegistryResult<BlobReader> {
        let name: RepositoryName = name.parse()?;
        let digest: Digest = digest.parse()?;
        self.blobs.read(&name, &digest).await
    }

    /// Start an upload, or mount `digest` from the `from` repository when both are given.
    ///
    /// A mount request that does not parse is ignored and a fresh upload starts.
    pub async fn initiate_upload(
        &self,
        name: &str,
        mount: Option<(&str, &str)>,
    ) -> RegistryResult<InitiateOutcome> {
        let name: RepositoryName = name.parse()?;
        let mount = mount.and_then(|(from, digest)| {
            match (from.parse::<RepositoryName>(), digest.parse::<Digest>()) {
                (Ok(from), Ok(digest)) => Some(MountRequest { from, digest }),
                _ => {
                    tracing::debug!(from, digest, "ignoring malformed mount request");
                    None
                }
            }
        });
        self.uploads.initiate(&name, mount).await
    }

    /// Current state of an upload.
    pub async fn upload_status(&self, name: &str, id: &str) -> RegistryResult<UploadStatus> {
        let name: RepositoryName = name.parse()?;
        self.uploads.status(&name, upload_id(id)?).await
    }

    /// Append a chunk to an upload. `range` is the declared `start-end`, if any.
    pub async fn upload_chunk(
        &self,
        name: &str,
        id: &str,
        range: Option<&str>,
        content: Bytes,
    ) -> RegistryResult<UploadStatus> {
        let name: RepositoryName = name.parse()?;
        let id = upload_id(id)?;
        let range = range.map(str::parse::<ContentRange>).transpose()?;
        self.uploads.write_chunk(&name, id, range, content).await
    }

    /// Stream a chunk of unknown length into an upload, at its current offset.
    pub async fn upload_stream<R>(
        &self,
        name: &str,
        id: &str,
        reader: &mut R,
    ) -> RegistryResult<UploadStatus>
    where
        R: AsyncBufRead + Unpin + Send + Sync,
    {
        let name: RepositoryName = name.parse()?;
        self.uploads.write_stream(&name, upload_id(id)?, reader).await
    }

    /// Finish an upload with its final digest and any trailing content.
    pub async fn complete_upload(
        &self,
        name: &str,
        id: &str,
        digest: &str,
        trailing: Option<Bytes>,
    ) -> RegistryResult<BlobDescriptor> {
        let name: RepositoryName = name.parse()?;
        let id = upload_id(id)?;
        let digest: Digest = digest.parse()?;
        self.uploads.complete(&name, id, &digest, trailing).await
    }

    /// Abandon an upload.
    pub async fn cancel_upload(&self, name: &str, id: &str) -> RegistryResult<()> {
        let name: RepositoryName = name.parse()?;
        self.uploads.cancel(&name, upload_id(id)?).await
    }

    /// Discard upload sessions idle past the configured TTL.
    pub async fn purge_expired_uploads(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        self.uploads.purge_expired(now).await
    }
}
