//! Content-addressable blob store
//!
//! Blob bytes are stored once per digest and linked into each repository that
//! contains them. A blob exists in a repository iff the repository's link and
//! the shared data both exist.

use std::pin::Pin;
use std::task::{Context, Poll};

use camino::Utf8Path;
use storage::StorageBucket;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tracing::Instrument;

use crate::digest::{Digest, DigestWriter};
use crate::error::{RegistryError, RegistryResult};
use crate::layout;
use crate::locks::KeyedLocks;
use crate::name::RepositoryName;

/// Size of the in-memory pipe between a background download and a blob reader.
const READ_BUFFER: usize = 64 * 1024;

/// A blob known to a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    /// Content digest
    pub digest: Digest,
    /// Length in bytes
    pub size: u64,
}

impl BlobDescriptor {
    /// Location of the blob, `/v2/<name>/blobs/<digest>`
    pub fn location(&self, repository: &RepositoryName) -> String {
        format!("/v2/{repository}/blobs/{}", self.digest)
    }
}

/// A streamed blob body. The size is known before any byte is read.
#[derive(Debug)]
pub struct BlobReader {
    descriptor: BlobDescriptor,
    reader: DuplexStream,
}

impl BlobReader {
    /// Digest and size of the blob being read
    pub fn descriptor(&self) -> &BlobDescriptor {
        &self.descriptor
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// Blob storage for every repository in one bucket.
#[derive(Debug, Clone)]
pub struct BlobStore {
    bucket: StorageBucket,
    locks: KeyedLocks,
}

impl BlobStore {
    /// Create a blob store in `bucket`
    pub fn new(bucket: StorageBucket) -> Self {
        Self {
            bucket,
            locks: KeyedLocks::new(),
        }
    }

    /// Check that `repository` contains `digest`, returning its size.
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn exists(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
    ) -> RegistryResult<BlobDescriptor> {
        let not_found = |err: storage::StorageError| {
            if err.is_not_found() {
                RegistryError::blob_unknown(digest)
            } else {
                err.into()
            }
        };

        self.bucket
            .metadata(&layout::layer_link(repository, digest))
            .await
            .map_err(not_found)?;
        let metadata = self
            .bucket
            .metadata(&layout::blob_data(digest))
            .await
            .map_err(not_found)?;

        Ok(BlobDescriptor {
            digest: digest.clone(),
            size: metadata.size,
        })
    }

    /// Open a blob for streaming.
    ///
    /// The content is downloaded in the background into a bounded pipe, so
    /// large blobs are never held in memory.
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn read(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
    ) -> RegistryResult<BlobReader> {
        let descriptor = self.exists(repository, digest).await?;
        let (mut writer, reader) = tokio::io::duplex(READ_BUFFER);

        let bucket = self.bucket.clone();
        let path = layout::blob_data(digest);
        tokio::spawn(
            async move {
                if let Err(err) = bucket.download(&path, &mut writer).await {
                    tracing::warn!(error = %err, "blob download interrupted");
                }
            }
            .in_current_span(),
        );

        Ok(BlobReader { descriptor, reader })
    }

    /// Verify `content` against `digest` and store it in `repository`.
    #[tracing::instrument(skip(self, content), fields(%repository, %digest, size = content.len()))]
    pub async fn finalize(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        content: &[u8],
    ) -> RegistryResult<BlobDescriptor> {
        let actual = Digest::compute(content);
        if actual != *digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let staged = layout::staging();
        let mut reader = content;
        self.bucket.upload(&staged, &mut reader).await?;
        self.publish(repository, digest, &staged).await
    }

    /// Verify the staged object at `staged` against `digest`, then publish it.
    ///
    /// The staged object is consumed on success. On a digest mismatch it is
    /// left untouched.
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn finalize_staged(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        staged: &Utf8Path,
    ) -> RegistryResult<BlobDescriptor> {
        let mut hasher = DigestWriter::new();
        self.bucket.download(staged, &mut hasher).await?;
        let (actual, size) = hasher.finish();

        if actual != *digest {
            tracing::warn!(%actual, size, "staged content does not match declared digest");
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        self.publish(repository, digest, staged).await
    }

    /// Link a blob `source` already holds into `target`, without copying bytes.
    ///
    /// Returns `None` when `source` does not contain the blob.
    #[tracing::instrument(skip(self), fields(%target, %source, %digest))]
    pub async fn mount(
        &self,
        target: &RepositoryName,
        source: &RepositoryName,
        digest: &Digest,
    ) -> RegistryResult<Option<BlobDescriptor>> {
        let descriptor = match self.exists(source, digest).await {
            Ok(descriptor) => descriptor,
            Err(RegistryError::BlobUnknown { .. }) => {
                tracing::debug!("mount source does not hold blob");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        self.link(target, digest).await?;
        tracing::info!(size = descriptor.size, "mounted blob");
        Ok(Some(descriptor))
    }

    /// Move verified content into its digest path, once per digest.
    async fn publish(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        staged: &Utf8Path,
    ) -> RegistryResult<BlobDescriptor> {
        let data = layout::blob_data(digest);

        let size = {
            let _guard = self.locks.lock(digest.to_string()).await;
            match self.bucket.metadata(&data).await {
                Ok(metadata) => {
                    tracing::debug!("blob already stored, discarding staged copy");
                    self.bucket.delete(staged).await?;
                    metadata.size
                }
                Err(err) if err.is_not_found() => {
                    self.bucket.rename(staged, &data).await?;
                    let size = self.bucket.metadata(&data).await?.size;
                    tracing::info!(size, "published blob");
                    size
                }
                Err(err) => return Err(err.into()),
            }
        };

        self.link(repository, digest).await?;
        Ok(BlobDescriptor {
            digest: digest.clone(),
            size,
        })
    }

    async fn link(&self, repository: &RepositoryName, digest: &Digest) -> RegistryResult<()> {
        let link = layout::layer_link(repository, digest);
        layout::publish(&self.bucket, &link, digest.to_string().as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;
    use tokio::io::AsyncReadExt;

    fn store() -> (StorageBucket, BlobStore) {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["test"]).into();
        let bucket = storage.bucket("test");
        (bucket.clone(), BlobStore::new(bucket))
    }

    fn repo(name: &str) -> RepositoryName {
        name.parse().unwrap()
    }

    async fn stored_blobs(bucket: &StorageBucket) -> Vec<String> {
        bucket.list(Some(Utf8Path::new("blobs"))).await.unwrap()
    }

    #[tokio::test]
    async fn finalize_then_read() {
        let (_, store) = store();
        let content = b"layer contents";
        let digest = Digest::compute(content);

        let descriptor = store
            .finalize(&repo("lib/app"), &digest, content)
            .await
            .unwrap();
        assert_eq!(descriptor.size, content.len() as u64);
        assert_eq!(
            descriptor.location(&repo("lib/app")),
            format!("/v2/lib/app/blobs/{digest}")
        );

        let mut reader = store.read(&repo("lib/app"), &digest).await.unwrap();
        assert_eq!(reader.descriptor().size, content.len() as u64);
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, content);
    }

    #[tokio::test]
    async fn finalize_rejects_mismatch() {
        let (bucket, store) = store();
        let digest = Digest::compute(b"expected");

        let err = store
            .finalize(&repo("app"), &digest, b"actual")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(stored_blobs(&bucket).await.is_empty());
        assert!(matches!(
            store.exists(&repo("app"), &digest).await,
            Err(RegistryError::BlobUnknown { .. })
        ));
    }

    #[tokio::test]
    async fn finalize_twice_keeps_one_copy() {
        let (bucket, store) = store();
        let content = b"same bytes";
        let digest = Digest::compute(content);

        for _ in 0..2 {
            store.finalize(&repo("app"), &digest, content).await.unwrap();
        }

        assert_eq!(stored_blobs(&bucket).await.len(), 1);
        let staged = bucket.list(Some(Utf8Path::new("_staging"))).await.unwrap();
        assert!(staged.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finalize_keeps_one_copy() {
        let (bucket, store) = store();
        let content = vec![7u8; 32 * 1024];
        let digest = Digest::compute(&content);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let digest = digest.clone();
                let content = content.clone();
                tokio::spawn(async move { store.finalize(&repo("app"), &digest, &content).await })
            })
            .collect();

        for task in tasks {
            let descriptor = task.await.unwrap().unwrap();
            assert_eq!(descriptor.size, content.len() as u64);
        }

        assert_eq!(stored_blobs(&bucket).await.len(), 1);
    }

    #[tokio::test]
    async fn blobs_are_scoped_to_repositories() {
        let (_, store) = store();
        let content = b"scoped";
        let digest = Digest::compute(content);
        store.finalize(&repo("one"), &digest, content).await.unwrap();

        store.exists(&repo("one"), &digest).await.unwrap();
        let err = store.exists(&repo("two"), &digest).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobUnknown { .. }));
        assert!(matches!(
            store.read(&repo("two"), &digest).await,
            Err(RegistryError::BlobUnknown { .. })
        ));
    }

    #[tokio::test]
    async fn mount_links_without_copying() {
        let (bucket, store) = store();
        let content = b"shared layer";
        let digest = Digest::compute(content);
        store
            .finalize(&repo("source"), &digest, content)
            .await
            .unwrap();

        let mounted = store
            .mount(&repo("target"), &repo("source"), &digest)
            .await
            .unwrap();
        assert_eq!(mounted.map(|d| d.size), Some(content.len() as u64));
        store.exists(&repo("target"), &digest).await.unwrap();
        assert_eq!(stored_blobs(&bucket).await.len(), 1);

        let missing = Digest::compute(b"never pushed");
        let mounted = store
            .mount(&repo("target"), &repo("source"), &missing)
            .await
            .unwrap();
        assert_eq!(mounted, None);
    }

    #[tokio::test]
    async fn finalize_staged_leaves_mismatch_in_place() {
        let (bucket, store) = store();
        let staged = Utf8Path::new("repositories/app/_uploads/x/data");
        let mut content: &[u8] = b"staged";
        bucket.upload(staged, &mut content).await.unwrap();

        let wrong = Digest::compute(b"other");
        let err = store
            .finalize_staged(&repo("app"), &wrong, staged)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert_eq!(bucket.metadata(staged).await.unwrap().size, 6);

        let digest = Digest::compute(b"staged");
        store
            .finalize_staged(&repo("app"), &digest, staged)
            .await
            .unwrap();
        assert!(bucket.metadata(staged).await.unwrap_err().is_not_found());
    }
}
