use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that stores files in memory.
///
/// Every mutation happens under a single write lock, so uploads and renames are
/// trivially atomic for readers.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.insert(bucket, HashMap::new());
    }

    fn missing_bucket(&self, bucket: &str) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Bucket not found: {bucket}"),
            ),
        )
        .bucket(bucket)
        .context("bucket not found")
        .build()
    }

    async fn read_all(&self, reader: &mut Reader<'_>) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        tokio::io::copy(reader, &mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        bucket_map
            .get(remote)
            .map(Metadata::from)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        bucket_map.remove(remote);

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let buf = self.read_all(local).await?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let buf = self.read_all(local).await?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        let item = bucket_map
            .entry(remote.to_owned())
            .or_insert_with(|| Vec::<u8>::new().into());
        item.data.extend_from_slice(&buf);

        Ok(item.data.len() as u64)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        let item = bucket_map
            .remove(from)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, from.as_str()))?;
        bucket_map.insert(to.to_owned(), item);

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        // Copy out under the read lock so slow writers don't hold it.
        let data = {
            let buckets = self.buckets.read().await;
            let bucket_map = buckets
                .get(bucket)
                .ok_or_else(|| self.missing_bucket(bucket))?;
            bucket_map
                .get(remote)
                .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?
                .as_ref()
                .to_vec()
        };

        let mut buf = data.as_slice();
        tokio::io::copy(&mut buf, local)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        tokio::io::AsyncWriteExt::flush(local)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;

        let mut paths: Vec<String> = bucket_map
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(storage: &MemoryStorage, path: &str, data: &[u8]) {
        let mut reader = data;
        storage
            .upload("bucket", Utf8Path::new(path), &mut reader)
            .await
            .unwrap();
    }

    async fn get(storage: &MemoryStorage, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        storage
            .download("bucket", Utf8Path::new(path), &mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn append_creates_and_grows() {
        let storage = MemoryStorage::with_buckets(&["bucket"]);

        let mut chunk: &[u8] = b"hello ";
        let size = storage
            .append("bucket", Utf8Path::new("uploads/a"), &mut chunk)
            .await
            .unwrap();
        assert_eq!(size, 6);

        let mut chunk: &[u8] = b"world";
        let size = storage
            .append("bucket", Utf8Path::new("uploads/a"), &mut chunk)
            .await
            .unwrap();
        assert_eq!(size, 11);

        assert_eq!(get(&storage, "uploads/a").await, b"hello world");
    }

    #[tokio::test]
    async fn rename_replaces_destination() {
        let storage = MemoryStorage::with_buckets(&["bucket"]);
        put(&storage, "staging/x", b"new").await;
        put(&storage, "final/x", b"old").await;

        storage
            .rename("bucket", Utf8Path::new("staging/x"), Utf8Path::new("final/x"))
            .await
            .unwrap();

        assert_eq!(get(&storage, "final/x").await, b"new");
        let err = storage
            .metadata("bucket", Utf8Path::new("staging/x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rename_missing_source() {
        let storage = MemoryStorage::with_buckets(&["bucket"]);
        let err = storage
            .rename("bucket", Utf8Path::new("nope"), Utf8Path::new("there"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_by_component_prefix() {
        let storage = MemoryStorage::with_buckets(&["bucket"]);
        put(&storage, "tags/app/latest", b"1").await;
        put(&storage, "tags/app/v1", b"2").await;
        put(&storage, "tags/application/v1", b"3").await;

        let listed = storage
            .list("bucket", Some(Utf8Path::new("tags/app")))
            .await
            .unwrap();
        assert_eq!(listed, vec!["tags/app/latest", "tags/app/v1"]);
    }

    #[tokio::test]
    async fn metadata_reports_size() {
        let storage = MemoryStorage::with_buckets(&["bucket"]);
        put(&storage, "blob", b"12345").await;
        let metadata = storage
            .metadata("bucket", Utf8Path::new("blob"))
            .await
            .unwrap();
        assert_eq!(metadata.size, 5);
    }
}
