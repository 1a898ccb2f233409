//! Resumable chunked blob uploads
//!
//! Each session moves through `Initiated -> Receiving(offset) -> {Completed |
//! Cancelled}`. Accepted chunks are appended to a staging object in the
//! storage backend; completion verifies the staged bytes and hands them to the
//! [`BlobStore`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8PathBuf;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use storage::{StorageBucket, StorageError, StorageErrorKind};
use tokio::io::AsyncBufRead;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::blob_store::{BlobDescriptor, BlobStore};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::layout;
use crate::name::RepositoryName;

/// An inclusive, zero based byte range `start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte offset
    pub start: u64,
    /// Last byte offset, inclusive
    pub end: u64,
}

impl ContentRange {
    /// Number of bytes covered by the range, or `None` if it does not fit in a `u64`
    pub fn size(&self) -> Option<u64> {
        self.end.checked_sub(self.start)?.checked_add(1)
    }
}

impl FromStr for ContentRange {
    type Err = RegistryError;

    /// Accepts `start-end`, `bytes start-end` and `bytes=start-end`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::range_invalid(format!("malformed range {s:?}"));

        let range = s.trim();
        let range = range
            .strip_prefix("bytes=")
            .or_else(|| range.strip_prefix("bytes "))
            .unwrap_or(range);

        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;
        if end < start {
            return Err(invalid());
        }

        Ok(ContentRange { start, end })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// The externally visible state of an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    /// Session id
    pub id: Uuid,
    /// Repository the session belongs to
    pub repository: RepositoryName,
    /// Bytes accepted so far
    pub offset: u64,
}

impl UploadStatus {
    /// Covered range, `0-<offset-1>`, or `0-0` for an empty session
    pub fn range(&self) -> String {
        format!("0-{}", self.offset.saturating_sub(1))
    }

    /// `/v2/<name>/blobs/uploads/<id>`
    pub fn location(&self) -> String {
        format!("/v2/{}/blobs/uploads/{}", self.repository, self.id)
    }
}

/// A request to mount a blob from another repository instead of uploading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Repository which already holds the blob
    pub from: RepositoryName,
    /// Blob to mount
    pub digest: Digest,
}

/// Outcome of initiating an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiateOutcome {
    /// The requested blob was mounted; no upload is needed
    Mounted(BlobDescriptor),
    /// A new session was started
    Started(UploadStatus),
}

#[derive(Debug)]
struct UploadSession {
    id: Uuid,
    repository: RepositoryName,
    offset: u64,
    staged: Utf8PathBuf,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed: bool,
}

impl UploadSession {
    fn status(&self) -> UploadStatus {
        UploadStatus {
            id: self.id,
            repository: self.repository.clone(),
            offset: self.offset,
        }
    }
}

type SessionTable = DashMap<Uuid, Arc<Mutex<UploadSession>>>;

/// Live upload sessions.
///
/// Sessions are held in memory and are not persisted across restarts. Each
/// session is guarded by its own lock, so unrelated uploads never contend.
#[derive(Debug, Clone)]
pub struct UploadManager {
    bucket: StorageBucket,
    blobs: BlobStore,
    sessions: Arc<SessionTable>,
    ttl: TimeDelta,
}

impl UploadManager {
    /// Create a session manager staging uploads in `bucket`.
    ///
    /// Sessions idle for longer than `ttl` are removed by [`UploadManager::purge_expired`].
    pub fn new(bucket: StorageBucket, blobs: BlobStore, ttl: TimeDelta) -> Self {
        Self {
            bucket,
            blobs,
            sessions: Default::default(),
            ttl,
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true when no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Start an upload, or mount the blob when `mount` names a repository holding it.
    #[tracing::instrument(skip(self), fields(%repository))]
    pub async fn initiate(
        &self,
        repository: &RepositoryName,
        mount: Option<MountRequest>,
    ) -> RegistryResult<InitiateOutcome> {
        if let Some(mount) = mount {
            if let Some(descriptor) = self
                .blobs
                .mount(repository, &mount.from, &mount.digest)
                .await?
            {
                return Ok(InitiateOutcome::Mounted(descriptor));
            }
        }

        let id = Uuid::new_v4();
        let staged = layout::upload_data(repository, &id);
        let mut empty: &[u8] = &[];
        self.bucket.upload(&staged, &mut empty).await?;

        let now = Utc::now();
        let session = UploadSession {
            id,
            repository: repository.clone(),
            offset: 0,
            staged,
            started_at: now,
            updated_at: now,
            closed: false,
        };
        let status = session.status();
        self.sessions.insert(id, Arc::new(Mutex::new(session)));

        tracing::debug!(%id, "upload session started");
        Ok(InitiateOutcome::Started(status))
    }

    /// Append a chunk to a session.
    ///
    /// With a declared `range`, the chunk is accepted only if it starts at the
    /// current offset and its length matches the range. Without one, the chunk
    /// is appended at the current offset. A rejected chunk leaves the session
    /// unchanged.
    #[tracing::instrument(skip(self, content), fields(%repository, %id, size = content.len()))]
    pub async fn write_chunk(
        &self,
        repository: &RepositoryName,
        id: Uuid,
        range: Option<ContentRange>,
        content: Bytes,
    ) -> RegistryResult<UploadStatus> {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        check_session(&session, repository)?;

        if let Some(range) = range {
            if range.start != session.offset {
                return Err(RegistryError::range_invalid(format!(
                    "chunk starts at {} but the upload is at offset {}",
                    range.start, session.offset
                )));
            }
            if range.size() != Some(content.len() as u64) {
                return Err(RegistryError::range_invalid(format!(
                    "range {range} does not cover the {} bytes sent",
                    content.len()
                )));
            }
        }

        let mut reader: &[u8] = &content;
        self.append(&mut session, &mut reader, Some(content.len() as u64))
            .await?;
        Ok(session.status())
    }

    /// Stream a chunk of unknown length into a session, at its current offset.
    ///
    /// If the stream fails after some bytes reached storage, the session is
    /// discarded.
    #[tracing::instrument(skip(self, reader), fields(%repository, %id))]
    pub async fn write_stream<R>(
        &self,
        repository: &RepositoryName,
        id: Uuid,
        reader: &mut R,
    ) -> RegistryResult<UploadStatus>
    where
        R: AsyncBufRead + Unpin + Send + Sync,
    {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        check_session(&session, repository)?;

        self.append(&mut session, reader, None).await?;
        Ok(session.status())
    }

    /// Finish a session: append `trailing`, verify against `digest` and publish.
    ///
    /// On a digest mismatch the session stays live, with `trailing` accepted.
    #[tracing::instrument(skip(self, trailing), fields(%repository, %id, %digest))]
    pub async fn complete(
        &self,
        repository: &RepositoryName,
        id: Uuid,
        digest: &Digest,
        trailing: Option<Bytes>,
    ) -> RegistryResult<BlobDescriptor> {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        check_session(&session, repository)?;

        if let Some(trailing) = trailing.filter(|t| !t.is_empty()) {
            let mut reader: &[u8] = &trailing;
            self.append(&mut session, &mut reader, Some(trailing.len() as u64))
                .await?;
        }

        let descriptor = self
            .blobs
            .finalize_staged(repository, digest, &session.staged)
            .await?;

        session.closed = true;
        self.sessions.remove(&id);
        tracing::debug!(
            size = descriptor.size,
            elapsed = %(Utc::now() - session.started_at),
            "upload completed"
        );
        Ok(descriptor)
    }

    /// Discard a session and its staged bytes.
    #[tracing::instrument(skip(self), fields(%repository, %id))]
    pub async fn cancel(&self, repository: &RepositoryName, id: Uuid) -> RegistryResult<()> {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        check_session(&session, repository)?;
        self.close(&mut session).await
    }

    /// Current state of a session.
    #[tracing::instrument(level = "debug", skip(self), fields(%repository, %id))]
    pub async fn status(&self, repository: &RepositoryName, id: Uuid) -> RegistryResult<UploadStatus> {
        let session = self.session(id)?;
        let session = session.lock().await;
        check_session(&session, repository)?;
        Ok(session.status())
    }

    /// Cancel every session that has been idle for longer than the configured TTL.
    ///
    /// Sessions busy with a request are skipped. Returns the number of sessions removed.
    #[tracing::instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut purged = 0;
        for session in sessions {
            let Ok(mut session) = session.try_lock() else {
                continue;
            };
            if session.closed || now - session.updated_at <= self.ttl {
                continue;
            }

            tracing::debug!(id = %session.id, repository = %session.repository, "expiring upload");
            self.close(&mut session).await?;
            purged += 1;
        }

        if purged > 0 {
            tracing::info!(purged, "expired idle upload sessions");
        }
        Ok(purged)
    }

    fn session(&self, id: Uuid) -> RegistryResult<Arc<Mutex<UploadSession>>> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::upload_unknown(id))
    }

    /// Append to the staged object. `length`, when known, is the exact number
    /// of bytes `reader` yields.
    ///
    /// The staged object must always hold exactly `session.offset` bytes. A
    /// failed or short append which breaks that discards the session.
    async fn append<R>(
        &self,
        session: &mut UploadSession,
        reader: &mut R,
        length: Option<u64>,
    ) -> RegistryResult<()>
    where
        R: AsyncBufRead + Unpin + Send + Sync,
    {
        let size = match self.bucket.append(&session.staged, reader).await {
            Ok(size) => size,
            Err(err) => {
                let intact = matches!(
                    self.bucket.metadata(&session.staged).await,
                    Ok(metadata) if metadata.size == session.offset
                );
                if !intact {
                    self.discard(session).await;
                }
                return Err(err.into());
            }
        };

        let consistent = match length {
            Some(length) => session.offset.checked_add(length) == Some(size),
            None => size >= session.offset,
        };
        if !consistent {
            self.discard(session).await;
            let error = format!(
                "staged upload holds {size} bytes, expected {} more than {}",
                length.map_or_else(|| "some".to_string(), |l| l.to_string()),
                session.offset
            );
            return Err(StorageError::builder(
                self.bucket.driver_name(),
                StorageErrorKind::Other,
                error,
            )
            .bucket(self.bucket.bucket.clone())
            .path(session.staged.as_str())
            .build()
            .into());
        }

        session.offset = size;
        session.updated_at = Utc::now();
        Ok(())
    }

    /// Drop a session whose staged bytes no longer match its offset.
    async fn discard(&self, session: &mut UploadSession) {
        tracing::warn!(
            id = %session.id,
            offset = session.offset,
            "discarding upload with inconsistent staged data"
        );
        if let Err(err) = self.close(session).await {
            tracing::warn!(id = %session.id, error = %err, "failed to remove staged upload");
        }
    }

    async fn close(&self, session: &mut UploadSession) -> RegistryResult<()> {
        session.closed = true;
        self.sessions.remove(&session.id);
        self.bucket.delete(&session.staged).await?;
        Ok(())
    }
}

/// A session is only visible under its own repository, and only while live.
fn check_session(session: &UploadSession, repository: &RepositoryName) -> RegistryResult<()> {
    if session.closed || session.repository != *repository {
        return Err(RegistryError::upload_unknown(session.id));
    }
    Ok(())
}
