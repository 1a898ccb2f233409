//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
///
/// Every variant maps to exactly one stable distribution error code, see
/// [`RegistryError::code`]. Only [`RegistryError::Storage`] represents an
/// unexpected fault; everything else is a deterministic validation outcome.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Repository name fails the path grammar
    #[error("invalid repository name {name:?}: {reason}")]
    NameInvalid {
        /// The offending name
        name: String,
        /// Which rule was broken
        reason: &'static str,
    },

    /// Repository holds no data for the requested entity
    #[error("repository name not known to registry: {name}")]
    NameUnknown {
        /// Repository name
        name: String,
    },

    /// Reference does not resolve to a stored manifest
    #[error("manifest unknown: {name}:{reference}")]
    ManifestUnknown {
        /// Repository name
        name: String,
        /// Tag or digest as presented
        reference: String,
    },

    /// Document is not a recognized manifest shape
    #[error("manifest invalid: {reason}")]
    ManifestInvalid {
        /// What was wrong with the document
        reason: String,
    },

    /// Blob has no stored content in the repository
    #[error("blob unknown to registry: {digest}")]
    BlobUnknown {
        /// Requested digest
        digest: String,
    },

    /// Session id does not name a live upload
    #[error("blob upload unknown to registry: {id}")]
    BlobUploadUnknown {
        /// Session id as presented
        id: String,
    },

    /// Malformed upload request
    #[error("blob upload invalid: {reason}")]
    BlobUploadInvalid {
        /// What was wrong with the request
        reason: String,
    },

    /// Digest string is malformed or uses an unsupported algorithm
    #[error("invalid digest {digest:?}: {reason}")]
    DigestInvalid {
        /// Digest as presented
        digest: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Declared digest does not match the content
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest declared by the caller
        expected: String,
        /// Digest of the received content
        actual: String,
    },

    /// Chunk offset or length inconsistent with the session, or a malformed range
    #[error("invalid content range: {reason}")]
    RangeInvalid {
        /// What was inconsistent
        reason: String,
    },

    /// Operation not implemented for this resource
    #[error("operation unsupported: {0}")]
    Unsupported(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),
}

impl RegistryError {
    pub(crate) fn manifest_unknown(name: impl ToString, reference: impl ToString) -> Self {
        RegistryError::ManifestUnknown {
            name: name.to_string(),
            reference: reference.to_string(),
        }
    }

    pub(crate) fn blob_unknown(digest: impl ToString) -> Self {
        RegistryError::BlobUnknown {
            digest: digest.to_string(),
        }
    }

    pub(crate) fn upload_unknown(id: impl ToString) -> Self {
        RegistryError::BlobUploadUnknown { id: id.to_string() }
    }

    pub(crate) fn range_invalid(reason: impl Into<String>) -> Self {
        RegistryError::RangeInvalid {
            reason: reason.into(),
        }
    }

    pub(crate) fn manifest_invalid(reason: impl Into<String>) -> Self {
        RegistryError::ManifestInvalid {
            reason: reason.into(),
        }
    }

    /// Get the error code for distribution error responses
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::NameInvalid { .. } => "NAME_INVALID",
            RegistryError::NameUnknown { .. } => "NAME_UNKNOWN",
            RegistryError::ManifestUnknown { .. } => "MANIFEST_UNKNOWN",
            RegistryError::ManifestInvalid { .. } => "MANIFEST_INVALID",
            RegistryError::BlobUnknown { .. } => "BLOB_UNKNOWN",
            RegistryError::BlobUploadUnknown { .. } => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::BlobUploadInvalid { .. } => "BLOB_UPLOAD_INVALID",
            RegistryError::DigestInvalid { .. } | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::RangeInvalid { .. } => "RANGE_INVALID",
            RegistryError::Unsupported(_) => "UNSUPPORTED",
            RegistryError::Storage(_) => "UNKNOWN",
        }
    }

    /// Structured detail for the error, e.g. the offending digest or name
    pub fn detail(&self) -> serde_json::Value {
        match self {
            RegistryError::NameInvalid { name, .. } | RegistryError::NameUnknown { name } => {
                json!({ "name": name })
            }
            RegistryError::ManifestUnknown { name, reference } => {
                json!({ "name": name, "reference": reference })
            }
            RegistryError::ManifestInvalid { reason }
            | RegistryError::BlobUploadInvalid { reason }
            | RegistryError::RangeInvalid { reason } => json!({ "reason": reason }),
            RegistryError::BlobUnknown { digest } | RegistryError::DigestInvalid { digest, .. } => {
                json!({ "digest": digest })
            }
            RegistryError::BlobUploadUnknown { id } => json!({ "uuid": id }),
            RegistryError::DigestMismatch { expected, actual } => {
                json!({ "digest": expected, "actual": actual })
            }
            RegistryError::Unsupported(operation) => json!({ "operation": operation }),
            RegistryError::Storage(_) => serde_json::Value::Null,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NameUnknown { .. }
            | RegistryError::ManifestUnknown { .. }
            | RegistryError::BlobUnknown { .. }
            | RegistryError::BlobUploadUnknown { .. } => StatusCode::NOT_FOUND,
            RegistryError::NameInvalid { .. }
            | RegistryError::ManifestInvalid { .. }
            | RegistryError::BlobUploadInvalid { .. }
            | RegistryError::DigestInvalid { .. }
            | RegistryError::DigestMismatch { .. } => StatusCode::BAD_REQUEST,
            RegistryError::RangeInvalid { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Distribution error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    detail: serde_json::Value,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let RegistryError::Storage(err) = &self {
            tracing::error!(error = %err, span_trace = %err.span_trace(), "storage fault");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                detail: self.detail(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
