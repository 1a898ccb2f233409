//! Manifest store and reference resolver

use bytes::Bytes;
use storage::StorageBucket;

use crate::blob_store::BlobStore;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::layout;
use crate::locks::KeyedLocks;
use crate::name::{Reference, RepositoryName, Tag};
use crate::schema::{self, Manifest};

/// A stored manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDocument {
    /// Digest of the document bytes
    pub digest: Digest,
    /// Media type the document was pushed with
    pub media_type: String,
    /// The exact bytes that were pushed
    pub content: Bytes,
}

/// Manifest metadata, available without reading the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMetadata {
    /// Digest of the document bytes
    pub digest: Digest,
    /// Length of the document in bytes
    pub size: u64,
    /// Media type the document was pushed with
    pub media_type: String,
}

/// Result of a successful manifest push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPut {
    /// Digest of the pushed document
    pub digest: Digest,
    /// `/v2/<name>/manifests/<digest>`
    pub location: String,
    /// The tag that now points at the document, if pushed by tag
    pub tag: Option<Tag>,
}

/// Manifest revisions and tags for every repository in one bucket.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    bucket: StorageBucket,
    blobs: BlobStore,
    tag_locks: KeyedLocks,
}

impl ManifestStore {
    /// Create a manifest store in `bucket`, checking references against `blobs`.
    pub fn new(bucket: StorageBucket, blobs: BlobStore) -> Self {
        Self {
            bucket,
            blobs,
            tag_locks: KeyedLocks::new(),
        }
    }

    /// Resolve a reference to a digest.
    ///
    /// Digest references are returned as-is, without touching storage.
    #[tracing::instrument(level = "debug", skip(self), fields(%repository, %reference))]
    pub async fn resolve(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> RegistryResult<Digest> {
        let tag = match reference {
            Reference::Digest(digest) => return Ok(digest.clone()),
            Reference::Tag(tag) => tag,
        };

        let link = layout::read_pointer(&self.bucket, &layout::tag_link(repository, tag))
            .await?
            .ok_or_else(|| RegistryError::manifest_unknown(repository, reference))?;

        link.parse().map_err(|err| {
            tracing::warn!(%link, error = %err, "tag link holds a malformed digest");
            RegistryError::manifest_unknown(repository, reference)
        })
    }

    /// Fetch a manifest document.
    #[tracing::instrument(skip(self), fields(%repository, %reference))]
    pub async fn get(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> RegistryResult<ManifestDocument> {
        let digest = match self.resolve(repository, reference).await {
            Ok(digest) => digest,
            Err(RegistryError::ManifestUnknown { .. }) => {
                return Err(self.unknown(repository, reference).await?);
            }
            Err(err) => return Err(err),
        };

        let mut content = Vec::new();
        match self
            .bucket
            .download(&layout::revision_data(repository, &digest), &mut content)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                return Err(self.unknown(repository, reference).await?);
            }
            Err(err) => return Err(err.into()),
        }

        let media_type = self.media_type(repository, &digest, Some(&content)).await?;
        Ok(ManifestDocument {
            digest,
            media_type,
            content: content.into(),
        })
    }

    /// Check for a manifest, returning its metadata without reading the document.
    #[tracing::instrument(skip(self), fields(%repository, %reference))]
    pub async fn exists(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> RegistryResult<ManifestMetadata> {
        let digest = self.resolve(repository, reference).await?;
        let metadata = self
            .bucket
            .metadata(&layout::revision_data(repository, &digest))
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    RegistryError::manifest_unknown(repository, reference)
                } else {
                    err.into()
                }
            })?;

        let media_type = self.media_type(repository, &digest, None).await?;
        Ok(ManifestMetadata {
            digest,
            size: metadata.size,
            media_type,
        })
    }

    /// Validate and store a manifest, repointing the tag when pushed by tag.
    ///
    /// Nothing is written unless the document parses and every blob or nested
    /// manifest it references already exists in `repository`.
    #[tracing::instrument(skip(self, content), fields(%repository, %reference, size = content.len()))]
    pub async fn put(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
        content_type: Option<&str>,
        content: Bytes,
    ) -> RegistryResult<ManifestPut> {
        let digest = Digest::compute(&content);
        if let Reference::Digest(expected) = reference {
            if *expected != digest {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        let parsed = Manifest::parse(&content, content_type)?;
        self.check_references(repository, &parsed.manifest).await?;

        layout::publish(
            &self.bucket,
            &layout::revision_media_type(repository, &digest),
            parsed.media_type.as_bytes(),
        )
        .await?;
        layout::publish(
            &self.bucket,
            &layout::revision_data(repository, &digest),
            &content,
        )
        .await?;

        let tag = reference.tag().cloned();
        if let Some(tag) = &tag {
            let _guard = self.tag_locks.lock(tag_key(repository, tag)).await;
            layout::publish(
                &self.bucket,
                &layout::tag_link(repository, tag),
                digest.to_string().as_bytes(),
            )
            .await?;
            tracing::debug!(%tag, %digest, "tag updated");
        }

        Ok(ManifestPut {
            location: format!("/v2/{repository}/manifests/{digest}"),
            digest,
            tag,
        })
    }

    /// Delete a manifest, detaching every tag that points at it.
    #[tracing::instrument(skip(self), fields(%repository, %reference))]
    pub async fn delete(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> RegistryResult<Digest> {
        let metadata = self.exists(repository, reference).await?;
        let digest = metadata.digest;

        for tag in self.tag_names(repository).await? {
            let _guard = self.tag_locks.lock(tag_key(repository, &tag)).await;
            let link = layout::tag_link(repository, &tag);
            let target = layout::read_pointer(&self.bucket, &link).await?;
            if target.as_deref() == Some(digest.to_string().as_str()) {
                self.bucket.delete(&link).await?;
                tracing::info!(%tag, %digest, "detached tag from deleted manifest");
            }
        }

        self.bucket
            .delete(&layout::revision_data(repository, &digest))
            .await?;
        self.bucket
            .delete(&layout::revision_media_type(repository, &digest))
            .await?;

        Ok(digest)
    }

    /// List the tags of a repository, sorted.
    #[tracing::instrument(skip(self), fields(%repository))]
    pub async fn tags(&self, repository: &RepositoryName) -> RegistryResult<Vec<String>> {
        let tags = self.tag_names(repository).await?;
        if tags.is_empty() && !self.has_manifests(repository).await? {
            return Err(RegistryError::NameUnknown {
                name: repository.to_string(),
            });
        }

        Ok(tags.into_iter().map(|tag| tag.to_string()).collect())
    }

    async fn tag_names(&self, repository: &RepositoryName) -> RegistryResult<Vec<Tag>> {
        let files = self.bucket.list(Some(&layout::tags(repository))).await?;
        let mut tags: Vec<Tag> = files
            .iter()
            .filter_map(|path| layout::tag_from_link(repository, path))
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    async fn has_manifests(&self, repository: &RepositoryName) -> RegistryResult<bool> {
        let revisions = self
            .bucket
            .list(Some(&layout::revisions(repository)))
            .await?;
        Ok(revisions.iter().any(|path| path.ends_with("/data")))
    }

    /// The not-found error for `reference`: `NameUnknown` when the repository
    /// holds no manifests at all.
    async fn unknown(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> RegistryResult<RegistryError> {
        if self.has_manifests(repository).await? {
            Ok(RegistryError::manifest_unknown(repository, reference))
        } else {
            Ok(RegistryError::NameUnknown {
                name: repository.to_string(),
            })
        }
    }

    async fn media_type(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        content: Option<&[u8]>,
    ) -> RegistryResult<String> {
        let path = layout::revision_media_type(repository, digest);
        if let Some(media_type) = layout::read_pointer(&self.bucket, &path).await? {
            return Ok(media_type);
        }

        match content {
            Some(content) => Ok(schema::detect_media_type(content)),
            None => {
                let mut content = Vec::new();
                self.bucket
                    .download(&layout::revision_data(repository, digest), &mut content)
                    .await?;
                Ok(schema::detect_media_type(&content))
            }
        }
    }

    async fn check_references(
        &self,
        repository: &RepositoryName,
        manifest: &Manifest,
    ) -> RegistryResult<()> {
        match manifest {
            Manifest::Image(image) => {
                for descriptor in std::iter::once(&image.config).chain(&image.layers) {
                    self.blobs.exists(repository, &descriptor.digest).await?;
                }
            }
            Manifest::List(list) => {
                for entry in &list.manifests {
                    let digest = &entry.descriptor.digest;
                    match self
                        .bucket
                        .metadata(&layout::revision_data(repository, digest))
                        .await
                    {
                        Ok(_) => {}
                        Err(err) if err.is_not_found() => {
                            return Err(RegistryError::manifest_unknown(repository, digest));
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(())
    }
}

fn tag_key(repository: &RepositoryName, tag: &Tag) -> String {
    format!("{repository}:{tag}")
}
