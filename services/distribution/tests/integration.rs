//! Integration tests for the distribution API

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use bytes::Bytes;
use distribution::{Digest, OCI_MANIFEST_V1, RegistryBuilder};
use http_body_util::BodyExt;
use storage::MemoryStorage;
use tower::ServiceExt;

/// Helper to create a test registry
fn test_registry() -> Router {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    RegistryBuilder::new()
        .storage(storage.into())
        .bucket("test-registry")
        .build()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn body(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn error_code(response: Response<Body>) -> String {
    let envelope: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    envelope["errors"][0]["code"].as_str().unwrap().to_string()
}

fn header_str<'r>(response: &'r Response<Body>, name: &str) -> &'r str {
    response.headers()[name].to_str().unwrap()
}

/// Start an upload session, returning its location.
async fn start_upload(app: &Router, name: &str) -> String {
    let response = send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/{name}/blobs/uploads/"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-0");
    assert!(response.headers().contains_key("docker-upload-uuid"));
    header_str(&response, "location").to_string()
}

/// Push a blob in one request.
async fn push_blob(app: &Router, name: &str, data: &'static [u8]) -> Digest {
    let digest = Digest::compute(data);
    let response = send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/{name}/blobs/uploads/?digest={digest}"))
            .body(Body::from(Bytes::from_static(data)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    digest
}

fn image_manifest(config: &Digest, layer: &Digest) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST_V1,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": 2,
            "digest": config,
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "size": 2,
            "digest": layer,
        }],
    }))
    .unwrap()
}

async fn put_manifest(app: &Router, name: &str, reference: &str, manifest: Vec<u8>) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/{name}/manifests/{reference}"))
            .header(header::CONTENT_TYPE, OCI_MANIFEST_V1)
            .body(Body::from(manifest))
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry();

    let response = send(&app, Request::builder().uri("/v2/").body(Body::empty()).unwrap()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "docker-distribution-api-version"),
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_chunked_blob_upload_and_download() {
    let app = test_registry();

    let data = b"Hello, OCI Registry!";
    let digest = Digest::compute(data);
    let location = start_upload(&app, "test-repo").await;

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "0-9")
            .body(Body::from(Bytes::from_static(&data[..10])))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-9");
    assert_eq!(header_str(&response, "location"), location);

    let response = send(
        &app,
        Request::builder()
            .method("GET")
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-9");

    // The remaining bytes travel with the closing request.
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::from(Bytes::from_static(&data[10..])))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/test-repo/blobs/{digest}")
    );
    assert_eq!(header_str(&response, "docker-content-digest"), digest.to_string());

    let response = send(
        &app,
        Request::builder()
            .uri(format!("/v2/test-repo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), data.len().to_string());
    assert_eq!(&body(response).await[..], data);

    // The session is gone once completed.
    let response = send(
        &app,
        Request::builder()
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_blob_head() {
    let app = test_registry();
    let digest = push_blob(&app, "test-repo", b"test blob data").await;

    let response = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri(format!("/v2/test-repo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), "14");
    assert_eq!(header_str(&response, "docker-content-digest"), digest.to_string());
    assert!(body(response).await.is_empty());
}

#[tokio::test]
async fn test_blob_scoped_to_repository() {
    let app = test_registry();
    let digest = push_blob(&app, "one", b"scoped").await;

    let response = send(
        &app,
        Request::builder()
            .method("GET")
            .uri(format!("/v2/two/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_monolithic_upload_digest_mismatch() {
    let app = test_registry();
    let wrong = Digest::compute(b"something else");

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/test-repo/blobs/uploads/?digest={wrong}"))
            .body(Body::from("actual content"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri(format!("/v2/test-repo/blobs/{wrong}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chunk_gap_rejected() {
    let app = test_registry();
    let location = start_upload(&app, "test-repo").await;

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "5-9")
            .body(Body::from("later"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "RANGE_INVALID");

    let response = send(
        &app,
        Request::builder()
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-0");
}

#[tokio::test]
async fn test_cancel_upload() {
    let app = test_registry();
    let location = start_upload(&app, "test-repo").await;

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .body(Body::from("late"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_complete_without_digest() {
    let app = test_registry();
    let location = start_upload(&app, "test-repo").await;

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");
}

#[tokio::test]
async fn test_cross_repository_mount() {
    let app = test_registry();
    let digest = push_blob(&app, "library/base", b"shared layer").await;

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!(
                "/v2/library/app/blobs/uploads/?mount={digest}&from=library/base"
            ))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/library/app/blobs/{digest}")
    );

    // A source without the blob falls back to a regular upload.
    let missing = Digest::compute(b"not pushed");
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/library/app/blobs/uploads/?mount={missing}&from=library/base"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_malformed_mount_starts_upload() {
    let app = test_registry();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/app/blobs/uploads/?mount=sha256:bad&from=app")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().contains_key("docker-upload-uuid"));
}

#[tokio::test]
async fn test_streamed_chunks_bypass_body_limit() {
    let app = RegistryBuilder::new().body_limit(16).build();
    let data: Vec<u8> = (0..64).collect();
    let digest = Digest::compute(&data);

    let location = start_upload(&app, "big").await;
    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .body(Body::from(data[..40].to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-39");

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::from(data[40..].to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        Request::builder()
            .uri(format!("/v2/big/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(&body(response).await[..], &data[..]);

    // Chunks with a declared range are buffered, and still capped.
    let location = start_upload(&app, "big").await;
    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "0-39")
            .body(Body::from(data[..40].to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_manifest_under_name_with_blobs_component() {
    let app = test_registry();
    let config = push_blob(&app, "team/blobs/app", b"B1").await;
    let layer = push_blob(&app, "team/blobs/app", b"B2").await;

    let response = put_manifest(&app, "team/blobs/app", "latest", image_manifest(&config, &layer)).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        Request::builder()
            .uri("/v2/team/blobs/app/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_manifest_upload_and_download() {
    let app = test_registry();
    let config = push_blob(&app, "lib/app", b"B1").await;
    let layer = push_blob(&app, "lib/app", b"B2").await;
    let manifest = image_manifest(&config, &layer);
    let manifest_digest = Digest::compute(&manifest);

    let response = put_manifest(&app, "lib/app", "latest", manifest.clone()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_str(&response, "docker-content-digest"),
        manifest_digest.to_string()
    );
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/lib/app/manifests/{manifest_digest}")
    );

    for reference in ["latest".to_string(), manifest_digest.to_string()] {
        let response = send(
            &app,
            Request::builder()
                .uri(format!("/v2/lib/app/manifests/{reference}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK, "{reference}");
        assert_eq!(header_str(&response, "content-type"), OCI_MANIFEST_V1);
        assert_eq!(
            header_str(&response, "docker-content-digest"),
            manifest_digest.to_string()
        );
        assert_eq!(&body(response).await[..], &manifest[..]);
    }

    let response = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri("/v2/lib/app/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), manifest.len().to_string());

    let response = send(
        &app,
        Request::builder()
            .uri("/v2/lib/app/tags/list")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let tags: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(tags, serde_json::json!({ "name": "lib/app", "tags": ["latest"] }));
}

#[tokio::test]
async fn test_manifest_missing_blob() {
    let app = test_registry();
    let config = push_blob(&app, "app", b"B1").await;
    let layer = Digest::compute(b"never pushed");

    let response = put_manifest(&app, "app", "latest", image_manifest(&config, &layer)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");

    let response = send(
        &app,
        Request::builder()
            .uri("/v2/app/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_delete() {
    let app = test_registry();
    let config = push_blob(&app, "app", b"B1").await;
    let layer = push_blob(&app, "app", b"B2").await;
    let manifest = image_manifest(&config, &layer);
    let digest = Digest::compute(&manifest);

    put_manifest(&app, "app", "v1", manifest.clone()).await;
    put_manifest(&app, "app", "v2", image_manifest(&layer, &config)).await;

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/v2/app/manifests/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(
        &app,
        Request::builder()
            .uri("/v2/app/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");

    let response = send(
        &app,
        Request::builder()
            .uri("/v2/app/tags/list")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let tags: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(tags["tags"], serde_json::json!(["v2"]));
}

#[tokio::test]
async fn test_error_envelope() {
    let app = test_registry();

    let cases = [
        ("/v2/Upper/tags/list", StatusCode::BAD_REQUEST, "NAME_INVALID"),
        ("/v2/nobody/tags/list", StatusCode::NOT_FOUND, "NAME_UNKNOWN"),
        ("/v2/app/blobs/sha256:abc", StatusCode::BAD_REQUEST, "DIGEST_INVALID"),
        ("/v2/app/manifests/-bad", StatusCode::BAD_REQUEST, "MANIFEST_INVALID"),
        (
            "/v2/app/blobs/uploads/not-a-session",
            StatusCode::NOT_FOUND,
            "BLOB_UPLOAD_UNKNOWN",
        ),
    ];

    for (uri, status, code) in cases {
        let response = send(&app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), status, "{uri}");
        assert_eq!(
            header_str(&response, "content-type"),
            "application/json",
            "{uri}"
        );
        assert_eq!(error_code(response).await, code, "{uri}");
    }
}

#[tokio::test]
async fn test_temp_directory_storage() {
    let storage = storage::StorageConfig::Temp.build().unwrap();
    let app = RegistryBuilder::new()
        .storage(storage)
        .bucket("registry")
        .build();

    let digest = push_blob(&app, "on-disk", b"persisted bytes").await;

    let response = send(
        &app,
        Request::builder()
            .uri(format!("/v2/on-disk/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body(response).await[..], b"persisted bytes");
}
