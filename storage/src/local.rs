use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Suffix of the scratch files `upload` writes before renaming into place.
const PARTIAL_SUFFIX: &str = ".partial";

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Storage driver backed by a directory on the local filesystem.
///
/// Files live at `<root>/<bucket>/b/<remote>`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created lazily.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn bucket_root(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        self.bucket_root(bucket).join(remote)
    }

    fn error(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        context: &str,
        err: std::io::Error,
    ) -> StorageError {
        StorageError::builder(self.name(), StorageErrorKind::from(err.kind()), err)
            .bucket(bucket)
            .path(remote.as_str())
            .context(context)
            .build()
    }

    async fn create_parent(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<Utf8PathBuf, StorageError> {
        let path = self.path(bucket, remote);
        let parent = path.parent().ok_or_else(|| {
            StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build()
        })?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| self.error(bucket, remote, "create_dir_all", err))?;
        Ok(path)
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.error(bucket, remote, "metadata", err))?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(self.name(), bucket, remote.as_str()));
        }

        // Not every filesystem records a birth time.
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| self.error(bucket, remote, "metadata timestamp", err))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.error(bucket, remote, "remove_file", err)),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.create_parent(bucket, remote).await?;

        // Write beside the destination, then rename over it, so readers never
        // observe a half written file.
        let partial = Utf8PathBuf::from(format!(
            "{path}.{}.{}{PARTIAL_SUFFIX}",
            std::process::id(),
            PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&partial).await?);
            tokio::io::copy(local, &mut writer).await?;
            writer.shutdown().await?;
            tokio::fs::rename(&partial, &path).await
        }
        .await;

        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(self.error(bucket, remote, "upload", err));
        }
        Ok(())
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let path = self.create_parent(bucket, remote).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| self.error(bucket, remote, "open for append", err))?;

        let mut writer = tokio::io::BufWriter::new(file);
        tokio::io::copy(local, &mut writer)
            .await
            .map_err(|err| self.error(bucket, remote, "append", err))?;
        writer
            .shutdown()
            .await
            .map_err(|err| self.error(bucket, remote, "shutdown writer", err))?;

        let metadata = writer
            .get_ref()
            .metadata()
            .await
            .map_err(|err| self.error(bucket, remote, "metadata", err))?;
        Ok(metadata.len())
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let source = self.path(bucket, from);
        let destination = self.create_parent(bucket, to).await?;
        tokio::fs::rename(&source, &destination)
            .await
            .map_err(|err| self.error(bucket, from, "rename", err))
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.error(bucket, remote, "open remote file", err))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(|err| self.error(bucket, remote, "copy", err))?;

        local
            .flush()
            .await
            .map_err(|err| self.error(bucket, remote, "flush writer", err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.bucket_root(bucket);
        let start = match prefix {
            Some(prefix) => root.join(prefix),
            None => root.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&root, &start))
            .in_current_span()
            .await
            .map_err(|err| StorageError::new(self.name(), StorageErrorKind::Other, err))?
            .map_err(|err| {
                StorageError::builder(self.name(), StorageErrorKind::Io, err)
                    .bucket(bucket)
                    .context("walking directory")
                    .build()
            })?;

        tracing::debug!("Found {} entries", items.len());

        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }
}

/// Collect every file below `start`, as paths relative to `root`.
#[tracing::instrument(level = "trace")]
fn collect_list(root: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if start.is_dir() {
        visit(start, &mut files).wrap_err_with(|| format!("listing {start}"))?;
    }

    let mut items: Vec<Utf8PathBuf> = files
        .into_iter()
        .filter(|p| !p.as_str().ends_with(PARTIAL_SUFFIX))
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_owned()))
        .collect();
    items.sort();
    Ok(items)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
