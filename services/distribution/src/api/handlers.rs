//! Request handlers
//!
//! Each handler maps one request onto a [`Registry`] call and shapes the
//! result into distribution API headers.

use std::collections::HashMap;
use std::io;

use axum::body::Body;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};

use super::route::Route;
use crate::blob_store::BlobDescriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::name::RepositoryName;
use crate::registry::Registry;
use crate::upload::{InitiateOutcome, UploadStatus};

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
pub(crate) const DOCKER_DISTRIBUTION_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");

const OCTET_STREAM: &str = "application/octet-stream";

/// API version check endpoint
pub(crate) async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(serde_json::json!({})))
}

/// Stamp every response with the API version header.
pub(crate) async fn api_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        DOCKER_DISTRIBUTION_API_VERSION,
        HeaderValue::from_static("registry/2.0"),
    );
    response
}

/// Dispatch any request below `/v2/` to the matching resource handler.
pub(crate) async fn dispatch(
    State(registry): State<Registry>,
    Path(path): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let Some(route) = Route::parse(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let result = match (route, method) {
        (Route::Manifest { name, reference }, Method::GET) => {
            get_manifest(&registry, name, reference).await
        }
        (Route::Manifest { name, reference }, Method::HEAD) => {
            head_manifest(&registry, name, reference).await
        }
        (Route::Manifest { name, reference }, Method::PUT) => {
            let body = match buffered(request).await {
                Ok(body) => body,
                Err(rejection) => return rejection,
            };
            put_manifest(&registry, name, reference, &headers, body).await
        }
        (Route::Manifest { name, reference }, Method::DELETE) => {
            delete_manifest(&registry, name, reference).await
        }
        (Route::Blob { name, digest }, Method::GET) => get_blob(&registry, name, digest).await,
        (Route::Blob { name, digest }, Method::HEAD) => head_blob(&registry, name, digest).await,
        (Route::Uploads { name }, Method::POST) => {
            start_upload(&registry, name, &query, request.into_body()).await
        }
        (Route::Upload { name, id }, Method::GET) => upload_status(&registry, name, id).await,
        (Route::Upload { name, id }, Method::PATCH)
            if headers.contains_key(header::CONTENT_RANGE) =>
        {
            let body = match buffered(request).await {
                Ok(body) => body,
                Err(rejection) => return rejection,
            };
            upload_chunk(&registry, name, id, &headers, body).await
        }
        (Route::Upload { name, id }, Method::PATCH) => {
            upload_stream(&registry, name, id, request.into_body()).await
        }
        (Route::Upload { name, id }, Method::PUT) => {
            complete_upload(&registry, name, id, &query, request.into_body()).await
        }
        (Route::Upload { name, id }, Method::DELETE) => cancel_upload(&registry, name, id).await,
        (Route::Tags { name }, Method::GET) => list_tags(&registry, name).await,
        (route, method) => Err(RegistryError::Unsupported(format!("{method} {route:?}"))),
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

/// Collect a body which must be handled whole, subject to the router's body limit.
async fn buffered(request: Request) -> Result<Bytes, Response> {
    Bytes::from_request(request, &())
        .await
        .map_err(IntoResponse::into_response)
}

/// Relay a request body to storage as an [`AsyncBufRead`] without buffering it.
///
/// Request bodies are not `Sync`, so frames pass through a channel.
fn body_reader(body: Body) -> impl AsyncBufRead + Unpin + Send + Sync {
    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(8);
    tokio::spawn(async move {
        let mut frames = body.into_data_stream();
        while let Some(frame) = frames.next().await {
            let failed = frame.is_err();
            if tx.send(frame.map_err(io::Error::other)).await.is_err() || failed {
                break;
            }
        }
    });
    StreamReader::new(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

fn header_value(value: impl ToString) -> HeaderValue {
    HeaderValue::try_from(value.to_string()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

async fn get_manifest(registry: &Registry, name: &str, reference: &str) -> RegistryResult<Response> {
    let document = registry.get_manifest(name, reference).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, header_value(&document.media_type)),
            (DOCKER_CONTENT_DIGEST, header_value(&document.digest)),
            (header::CONTENT_LENGTH, header_value(document.content.len())),
        ],
        document.content,
    )
        .into_response())
}

async fn head_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    let metadata = registry.manifest_exists(name, reference).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, header_value(&metadata.media_type)),
            (DOCKER_CONTENT_DIGEST, header_value(&metadata.digest)),
            (header::CONTENT_LENGTH, header_value(metadata.size)),
        ],
    )
        .into_response())
}

async fn put_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let put = registry
        .put_manifest(name, reference, content_type, body)
        .await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, header_value(&put.location)),
            (DOCKER_CONTENT_DIGEST, header_value(&put.digest)),
            (header::CONTENT_LENGTH, HeaderValue::from_static("0")),
        ],
    )
        .into_response())
}

async fn delete_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    registry.delete_manifest(name, reference).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

fn blob_headers(descriptor: &BlobDescriptor) -> [(HeaderName, HeaderValue); 3] {
    [
        (header::CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM)),
        (header::CONTENT_LENGTH, header_value(descriptor.size)),
        (DOCKER_CONTENT_DIGEST, header_value(&descriptor.digest)),
    ]
}

async fn get_blob(registry: &Registry, name: &str, digest: &str) -> RegistryResult<Response> {
    let reader = registry.get_blob(name, digest).await?;
    let headers = blob_headers(reader.descriptor());

    Ok((
        StatusCode::OK,
        headers,
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

async fn head_blob(registry: &Registry, name: &str, digest: &str) -> RegistryResult<Response> {
    let descriptor = registry.blob_exists(name, digest).await?;
    Ok((StatusCode::OK, blob_headers(&descriptor)).into_response())
}

fn upload_accepted(status: StatusCode, upload: &UploadStatus) -> Response {
    (
        status,
        [
            (header::LOCATION, header_value(upload.location())),
            (header::RANGE, header_value(upload.range())),
            (DOCKER_UPLOAD_UUID, header_value(upload.id)),
            (header::CONTENT_LENGTH, HeaderValue::from_static("0")),
        ],
    )
        .into_response()
}

fn blob_created(name: &str, descriptor: &BlobDescriptor) -> RegistryResult<Response> {
    let repository: RepositoryName = name.parse()?;
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, header_value(descriptor.location(&repository))),
            (DOCKER_CONTENT_DIGEST, header_value(&descriptor.digest)),
            (header::CONTENT_LENGTH, HeaderValue::from_static("0")),
        ],
    )
        .into_response())
}

async fn start_upload(
    registry: &Registry,
    name: &str,
    query: &HashMap<String, String>,
    body: Body,
) -> RegistryResult<Response> {
    if let Some(digest) = query.get("digest") {
        digest.parse::<Digest>()?;
    }

    let mount = match (query.get("mount"), query.get("from")) {
        (Some(digest), Some(from)) => Some((from.as_str(), digest.as_str())),
        _ => None,
    };

    let status = match registry.initiate_upload(name, mount).await? {
        InitiateOutcome::Mounted(descriptor) => return blob_created(name, &descriptor),
        InitiateOutcome::Started(status) => status,
    };

    // Monolithic upload: the whole blob in the POST body.
    if let Some(digest) = query.get("digest") {
        let id = status.id.to_string();
        let result: RegistryResult<BlobDescriptor> = async {
            registry
                .upload_stream(name, &id, &mut body_reader(body))
                .await?;
            registry.complete_upload(name, &id, digest, None).await
        }
        .await;

        return match result {
            Ok(descriptor) => blob_created(name, &descriptor),
            Err(err) => {
                if let Err(cancel) = registry.cancel_upload(name, &id).await {
                    tracing::warn!(%id, error = %cancel, "failed to cancel monolithic upload");
                }
                Err(err)
            }
        };
    }

    Ok(upload_accepted(StatusCode::ACCEPTED, &status))
}

async fn upload_status(registry: &Registry, name: &str, id: &str) -> RegistryResult<Response> {
    let status = registry.upload_status(name, id).await?;
    Ok(upload_accepted(StatusCode::NO_CONTENT, &status))
}

async fn upload_chunk(
    registry: &Registry,
    name: &str,
    id: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let range = headers
        .get(header::CONTENT_RANGE)
        .map(|v| {
            v.to_str().map_err(|_| RegistryError::RangeInvalid {
                reason: "content range is not ascii".to_string(),
            })
        })
        .transpose()?;

    let status = registry.upload_chunk(name, id, range, body).await?;
    Ok(upload_accepted(StatusCode::ACCEPTED, &status))
}

async fn upload_stream(
    registry: &Registry,
    name: &str,
    id: &str,
    body: Body,
) -> RegistryResult<Response> {
    let status = registry
        .upload_stream(name, id, &mut body_reader(body))
        .await?;
    Ok(upload_accepted(StatusCode::ACCEPTED, &status))
}

async fn complete_upload(
    registry: &Registry,
    name: &str,
    id: &str,
    query: &HashMap<String, String>,
    body: Body,
) -> RegistryResult<Response> {
    let digest = query
        .get("digest")
        .ok_or_else(|| RegistryError::BlobUploadInvalid {
            reason: "missing digest".to_string(),
        })?;
    digest.parse::<Digest>()?;

    registry
        .upload_stream(name, id, &mut body_reader(body))
        .await?;
    let descriptor = registry.complete_upload(name, id, digest, None).await?;
    blob_created(name, &descriptor)
}

async fn cancel_upload(registry: &Registry, name: &str, id: &str) -> RegistryResult<Response> {
    registry.cancel_upload(name, id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList<'n> {
    name: &'n str,
    tags: Vec<String>,
}

async fn list_tags(registry: &Registry, name: &str) -> RegistryResult<Response> {
    let tags = registry.list_tags(name).await?;
    Ok(Json(TagList { name, tags }).into_response())
}
