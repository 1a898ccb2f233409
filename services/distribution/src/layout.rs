//! Object layout inside the registry bucket
//!
//! ```text
//! blobs/sha256/<hh>/<hex>/data
//! repositories/<name>/_layers/sha256/<hex>/link
//! repositories/<name>/_manifests/revisions/sha256/<hex>/data
//! repositories/<name>/_manifests/revisions/sha256/<hex>/media-type
//! repositories/<name>/_manifests/tags/<tag>/current/link
//! repositories/<name>/_uploads/<uuid>/data
//! _staging/<uuid>
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use storage::StorageBucket;
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::name::{RepositoryName, Tag};

/// Shared data file of a blob, one per digest across all repositories.
pub(crate) fn blob_data(digest: &Digest) -> Utf8PathBuf {
    let hex = digest.hex();
    Utf8PathBuf::from(format!(
        "blobs/{}/{}/{hex}/data",
        digest.algorithm(),
        &hex[..2]
    ))
}

fn repository(name: &RepositoryName) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("repositories/{name}"))
}

/// Link recording that `name` contains the blob `digest`.
pub(crate) fn layer_link(name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
    repository(name).join(format!(
        "_layers/{}/{}/link",
        digest.algorithm(),
        digest.hex()
    ))
}

/// Directory holding every manifest revision of `name`.
pub(crate) fn revisions(name: &RepositoryName) -> Utf8PathBuf {
    repository(name).join("_manifests/revisions")
}

fn revision(name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
    revisions(name).join(format!("{}/{}", digest.algorithm(), digest.hex()))
}

/// Manifest document bytes.
pub(crate) fn revision_data(name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
    revision(name, digest).join("data")
}

/// Media type recorded for a manifest when it was pushed.
pub(crate) fn revision_media_type(name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
    revision(name, digest).join("media-type")
}

/// Directory holding every tag of `name`.
pub(crate) fn tags(name: &RepositoryName) -> Utf8PathBuf {
    repository(name).join("_manifests/tags")
}

/// Current target of a tag.
pub(crate) fn tag_link(name: &RepositoryName, tag: &Tag) -> Utf8PathBuf {
    tags(name).join(format!("{tag}/current/link"))
}

/// Extract the tag name from a path returned by listing [`tags`].
pub(crate) fn tag_from_link(name: &RepositoryName, path: &str) -> Option<Tag> {
    let rest = Utf8Path::new(path).strip_prefix(tags(name)).ok()?;
    let mut components = rest.components().map(|c| c.as_str());
    match (
        components.next(),
        components.next(),
        components.next(),
        components.next(),
    ) {
        (Some(tag), Some("current"), Some("link"), None) => Tag::new(tag),
        _ => None,
    }
}

/// Staged bytes of an upload session.
pub(crate) fn upload_data(name: &RepositoryName, id: &Uuid) -> Utf8PathBuf {
    repository(name).join(format!("_uploads/{id}/data"))
}

/// A fresh private staging location.
pub(crate) fn staging() -> Utf8PathBuf {
    Utf8PathBuf::from(format!("_staging/{}", Uuid::new_v4()))
}

/// Publish `content` at `path` by staging it and renaming it into place.
pub(crate) async fn publish(
    bucket: &StorageBucket,
    path: &Utf8Path,
    content: &[u8],
) -> RegistryResult<()> {
    let staged = staging();
    let mut reader = content;
    bucket.upload(&staged, &mut reader).await?;
    if let Err(err) = bucket.rename(&staged, path).await {
        let _ = bucket.delete(&staged).await;
        return Err(err.into());
    }
    Ok(())
}

/// Read a small pointer file, returning `None` when it does not exist.
pub(crate) async fn read_pointer(
    bucket: &StorageBucket,
    path: &Utf8Path,
) -> RegistryResult<Option<String>> {
    let mut data = Vec::new();
    match bucket.download(path, &mut data).await {
        Ok(()) => Ok(Some(String::from_utf8_lossy(&data).trim().to_string())),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name() -> RepositoryName {
        "lib/app".parse().unwrap()
    }

    #[test]
    fn paths() {
        let digest = Digest::compute(b"");
        let hex = digest.hex();

        assert_eq!(
            blob_data(&digest).as_str(),
            format!("blobs/sha256/e3/{hex}/data")
        );
        assert_eq!(
            layer_link(&name(), &digest).as_str(),
            format!("repositories/lib/app/_layers/sha256/{hex}/link")
        );
        assert_eq!(
            revision_data(&name(), &digest).as_str(),
            format!("repositories/lib/app/_manifests/revisions/sha256/{hex}/data")
        );

        let tag = Tag::new("latest").unwrap();
        assert_eq!(
            tag_link(&name(), &tag).as_str(),
            "repositories/lib/app/_manifests/tags/latest/current/link"
        );
    }

    #[test]
    fn tag_names_from_listing() {
        let tag = Tag::new("v1.0").unwrap();
        let link = tag_link(&name(), &tag);
        assert_eq!(tag_from_link(&name(), link.as_str()), Some(tag));

        assert_eq!(
            tag_from_link(&name(), "repositories/lib/app/_manifests/tags/v1/index/x"),
            None
        );
        assert_eq!(
            tag_from_link(&name(), "repositories/lib/other/_manifests/tags/v1/current/link"),
            None
        );
    }

    #[tokio::test]
    async fn publish_and_read_pointer() {
        let storage: storage::Storage = storage::MemoryStorage::with_buckets(&["test"]).into();
        let bucket = storage.bucket("test");
        let path = Utf8Path::new("pointer/link");

        assert_eq!(read_pointer(&bucket, path).await.unwrap(), None);

        publish(&bucket, path, b"sha256:abc").await.unwrap();
        assert_eq!(
            read_pointer(&bucket, path).await.unwrap().as_deref(),
            Some("sha256:abc")
        );

        let staged = bucket.list(Some(Utf8Path::new("_staging"))).await.unwrap();
        assert!(staged.is_empty());
    }
}
