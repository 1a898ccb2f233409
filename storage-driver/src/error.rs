use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the underlying storage backend implementation.
///
/// Callers branch on the kind rather than on error messages: the registry,
/// for example, turns `NotFound` into a "blob unknown" answer and treats
/// everything else as an internal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested resource (file, object, bucket) was not found.
    ///
    /// **Retryable:** No - the resource doesn't exist.
    NotFound,

    /// The caller lacks permission to perform the requested operation.
    ///
    /// **Retryable:** No - unless permissions change.
    PermissionDenied,

    /// The operation failed due to I/O errors (disk full, interrupted stream, etc.).
    ///
    /// **Retryable:** Maybe - depends on whether the I/O issue is transient.
    Io,

    /// The request was invalid (bad path, unknown bucket layout, etc.).
    ///
    /// **Retryable:** No - the request itself is invalid.
    InvalidRequest,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    ///
    /// This is advisory only.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Io)
    }

    /// Returns whether this error indicates a client-side fault (bad request, invalid params).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::InvalidRequest | StorageErrorKind::PermissionDenied
        )
    }
}

impl From<io::ErrorKind> for StorageErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace, controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,

    /// The tracing span context at the point where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error with operation context and diagnostic traces.
///
/// Carries:
/// - a semantic [`StorageErrorKind`]
/// - the engine, bucket and path involved
/// - the underlying error as its `source`
/// - a backtrace and a `tracing_error::SpanTrace`
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// fn open() -> Result<std::fs::File, StorageError> {
///     std::fs::File::open("missing.txt").map_err(|err| {
///         StorageError::builder("local", StorageErrorKind::from(err.kind()), err)
///             .bucket("my-bucket")
///             .path("missing.txt")
///             .build()
///     })
/// }
///
/// let err = open().unwrap_err();
/// assert!(err.is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more control, use `StorageError::builder()`.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageError::builder(engine, kind, error).build()
    }

    /// Create a storage error from an I/O error, deriving the kind from the
    /// I/O error kind.
    pub fn io(engine: &'static str, error: io::Error) -> Self {
        let kind = StorageErrorKind::from(error.kind());
        StorageError::new(engine, kind, error)
    }

    /// A `NotFound` error for a path in a bucket.
    pub fn not_found(engine: &'static str, bucket: &str, path: impl Into<String>) -> Self {
        let path = path.into();
        let error = io::Error::new(
            io::ErrorKind::NotFound,
            format!("Path not found: {bucket}/{path}"),
        );
        StorageError::builder(engine, StorageErrorKind::NotFound, error)
            .bucket(bucket)
            .path(path)
            .build()
    }

    /// Create a builder for constructing a storage error with full context.
    ///
    /// The engine, kind and underlying error are required; bucket, path and
    /// context are optional.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// Returns a closure that creates a storage error from an I/O error,
    /// attaching `context`. Useful with `.map_err()`.
    pub fn with_context(
        engine: &'static str,
        context: &'static str,
    ) -> impl FnOnce(io::Error) -> StorageError {
        move |error: io::Error| {
            StorageError::builder(engine, StorageErrorKind::from(error.kind()), error)
                .context(context)
                .build()
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns true if the resource was not found.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the file path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing `StorageError` with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the file path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
