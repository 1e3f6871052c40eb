use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, StatusCode},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures::{StreamExt, channel::mpsc, stream};
use std::{io, sync::Arc};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tower::ServiceExt;
use tus_server::{
    models::extension::{Extension, ExtensionSet},
    routes::routes::app,
    services::{
        file_store::{FileStore, connect_configstore},
        memory_store::MemoryStore,
    },
    state::{AppState, TusSettings},
};

const OFFSET_STREAM: &str = "application/offset+octet-stream";
const METADATA: &str = "filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,is_confidential";

async fn file_app(settings: TusSettings) -> (Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/meta/configstore.db", dir.path().display());
    let pool = connect_configstore(&url).await.unwrap();
    let store = FileStore::new(Arc::new(pool), dir.path().join("files"));
    (app(AppState::new(Arc::new(store), settings)), dir)
}

fn memory_app(settings: TusSettings) -> Router {
    app(AppState::new(Arc::new(MemoryStore::new()), settings))
}

async fn send(app: &Router, req: Request<Body>) -> Response<Body> {
    app.clone().oneshot(req).await.unwrap()
}

fn header<'a>(res: &'a Response<Body>, name: &str) -> Option<&'a str> {
    res.headers().get(name).map(|v| v.to_str().unwrap())
}

async fn create(app: &Router, length: u64) -> String {
    let res = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Length", length.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    header(&res, "location").unwrap().to_string()
}

async fn head(app: &Router, location: &str) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method("HEAD")
            .uri(location)
            .header("Tus-Resumable", "1.0.0")
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

fn patch(location: &str, offset: u64, body: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(location)
        .header("Tus-Resumable", "1.0.0")
        .header("Content-Type", OFFSET_STREAM)
        .header("Upload-Offset", offset.to_string())
        .header("Content-Length", body.len().to_string())
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn options_advertises_capabilities_without_version_header() {
    let (app, _dir) = file_app(TusSettings::default().with_max_size(1 << 30)).await;
    let res = send(
        &app,
        Request::builder()
            .method("OPTIONS")
            .uri("/files")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&res, "tus-resumable"), Some("1.0.0"));
    assert_eq!(header(&res, "tus-version"), Some("1.0.0"));
    assert_eq!(header(&res, "tus-max-size"), Some("1073741824"));
    assert_eq!(header(&res, "tus-checksum-algorithm"), Some("md5,sha256"));
    assert_eq!(
        header(&res, "tus-extension"),
        Some("creation,creation-with-upload,creation-defer-length,termination,checksum")
    );
}

#[tokio::test]
async fn full_upload_in_streamed_chunks() {
    let (app, _dir) = file_app(TusSettings::default()).await;

    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Length", "960244")
            .header("Upload-Metadata", METADATA)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(header(&res, "tus-resumable"), Some("1.0.0"));
    let location = header(&res, "location").unwrap().to_string();
    assert!(location.starts_with("/files/"));

    let res = head(&app, &location).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, "upload-offset"), Some("0"));
    assert_eq!(header(&res, "upload-length"), Some("960244"));
    assert_eq!(header(&res, "upload-metadata"), Some(METADATA));
    assert_eq!(header(&res, "cache-control"), Some("no-store"));

    let payload: Vec<u8> = (0..960244u32).map(|i| (i % 251) as u8).collect();
    let chunks: Vec<io::Result<Vec<u8>>> = payload.chunks(64 * 1024).map(|c| Ok(c.to_vec())).collect();
    let res = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header("Tus-Resumable", "1.0.0")
            .header("Content-Type", OFFSET_STREAM)
            .header("Upload-Offset", "0")
            .body(Body::from_stream(stream::iter(chunks)))
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&res, "upload-offset"), Some("960244"));

    let res = head(&app, &location).await;
    assert_eq!(header(&res, "upload-offset"), Some("960244"));
    assert_eq!(header(&res, "upload-length"), Some("960244"));

    let res = send(
        &app,
        Request::builder()
            .method("GET")
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), payload.len());
    assert!(body[..] == payload[..]);
}

#[tokio::test]
async fn deferred_length_is_declared_on_patch() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Defer-Length", "1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let location = header(&res, "location").unwrap().to_string();

    let res = head(&app, &location).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, "upload-offset"), Some("0"));
    assert_eq!(header(&res, "upload-defer-length"), Some("1"));
    assert_eq!(header(&res, "upload-length"), None);

    // Bytes before the length is known are refused.
    let res = send(&app, patch(&location, 0, b"hello")).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let mut req = patch(&location, 0, b"hello");
    req.headers_mut().insert("Upload-Length", "5".parse().unwrap());
    let res = send(&app, req).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&res, "upload-offset"), Some("5"));

    let res = head(&app, &location).await;
    assert_eq!(header(&res, "upload-length"), Some("5"));
    assert_eq!(header(&res, "upload-defer-length"), None);
}

#[tokio::test]
async fn unknown_ids_and_base_path_are_not_found() {
    let (app, _dir) = file_app(TusSettings::default()).await;

    let res = head(&app, "/files/0123456789abcdef0123456789abcdef").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&res, "tus-resumable"), Some("1.0.0"));

    let res = send(&app, patch("/files/0123456789abcdef0123456789abcdef", 0, b"x")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&res, "tus-resumable"), Some("1.0.0"));

    let res = send(&app, patch("/files", 0, b"x")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = send(
        &app,
        Request::builder()
            .uri("/nowhere")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&res, "tus-resumable"), Some("1.0.0"));
}

#[tokio::test]
async fn requests_without_version_are_rejected() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Upload-Length", "10")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(res.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(header(&res, "tus-version"), Some("1.0.0"));
    assert_eq!(header(&res, "tus-resumable"), Some("1.0.0"));
}

#[tokio::test]
async fn offset_conflicts_leave_bytes_untouched() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let location = create(&app, 10).await;

    assert_eq!(send(&app, patch(&location, 0, b"abc")).await.status(), StatusCode::NO_CONTENT);

    let res = send(&app, patch(&location, 1, b"zzz")).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(header(&head(&app, &location).await, "upload-offset"), Some("3"));
}

#[tokio::test]
async fn completed_upload_rejects_more_bytes() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let location = create(&app, 3).await;

    assert_eq!(send(&app, patch(&location, 0, b"abc")).await.status(), StatusCode::NO_CONTENT);
    let res = send(&app, patch(&location, 3, b"d")).await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(header(&head(&app, &location).await, "upload-offset"), Some("3"));
}

#[tokio::test]
async fn patch_requires_offset_stream_content_type() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let location = create(&app, 3).await;

    let mut req = patch(&location, 0, b"abc");
    req.headers_mut()
        .insert("Content-Type", "application/octet-stream".parse().unwrap());
    assert_eq!(send(&app, req).await.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn creation_beyond_max_size_is_rejected() {
    let (app, _dir) = file_app(TusSettings::default().with_max_size(100)).await;
    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Length", "101")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn creation_with_upload_stores_first_chunk() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Host", "tus.example.org")
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Length", "11")
            .header("Content-Type", OFFSET_STREAM)
            .header("Content-Length", "5")
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;

    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(header(&res, "upload-offset"), Some("5"));
    let location = header(&res, "location").unwrap();
    assert!(location.starts_with("http://tus.example.org/files/"));
}

#[tokio::test]
async fn termination_removes_the_upload() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let location = create(&app, 10).await;

    let delete = |uri: &str| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("Tus-Resumable", "1.0.0")
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&app, delete(&location)).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(head(&app, &location).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(send(&app, delete(&location)).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_without_termination_is_not_allowed() {
    let settings =
        TusSettings::default().with_extensions(ExtensionSet::default().without(Extension::Termination));
    let app = memory_app(settings);
    let location = create(&app, 10).await;

    let res = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(&location)
            .header("Tus-Resumable", "1.0.0")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(head(&app, &location).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn method_override_replaces_the_verb() {
    let app = memory_app(TusSettings::default());
    let location = create(&app, 4).await;

    let mut req = patch(&location, 0, b"data");
    *req.method_mut() = axum::http::Method::POST;
    req.headers_mut()
        .insert("X-HTTP-Method-Override", "PATCH".parse().unwrap());
    let res = send(&app, req).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&res, "upload-offset"), Some("4"));
}

#[tokio::test]
async fn checksum_mismatch_discards_the_chunk() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let location = create(&app, 5).await;

    let mut req = patch(&location, 0, b"hello");
    let wrong = format!("md5 {}", STANDARD.encode(md5::compute(b"jello").0));
    req.headers_mut()
        .insert("Upload-Checksum", wrong.parse().unwrap());
    let res = send(&app, req).await;
    assert_eq!(res.status().as_u16(), 460);
    assert_eq!(header(&head(&app, &location).await, "upload-offset"), Some("0"));

    let mut req = patch(&location, 0, b"hello");
    let right = format!("md5 {}", STANDARD.encode(md5::compute(b"hello").0));
    req.headers_mut()
        .insert("Upload-Checksum", right.parse().unwrap());
    assert_eq!(send(&app, req).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&head(&app, &location).await, "upload-offset"), Some("5"));
}

#[tokio::test]
async fn unsupported_checksum_algorithm_is_bad_request() {
    let app = memory_app(TusSettings::default());
    let location = create(&app, 5).await;

    let mut req = patch(&location, 0, b"hello");
    req.headers_mut()
        .insert("Upload-Checksum", "crc32 AAAAAA==".parse().unwrap());
    assert_eq!(send(&app, req).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn expired_uploads_are_gone() {
    let app = memory_app(TusSettings::default().with_expiration(chrono::Duration::zero()));
    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Length", "10")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert!(header(&res, "upload-expires").is_some_and(|v| v.ends_with(" GMT")));
    let location = header(&res, "location").unwrap().to_string();

    assert_eq!(head(&app, &location).await.status(), StatusCode::GONE);
    assert_eq!(send(&app, patch(&location, 0, b"x")).await.status(), StatusCode::GONE);
}

#[tokio::test]
async fn readiness_reports_store_checks() {
    let app = memory_app(TusSettings::default());
    let res = send(
        &app,
        Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);

    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["checks"]["store"]["ok"], true);
}

#[tokio::test]
async fn metadata_is_echoed_exactly_as_sent() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Length", "10")
            .header("Upload-Metadata", "some data, for you")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let location = header(&res, "location").unwrap().to_string();

    let res = head(&app, &location).await;
    assert_eq!(header(&res, "upload-metadata"), Some("some data, for you"));
}

#[tokio::test]
async fn simultaneous_patches_on_one_upload_conflict() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let location = create(&app, 8).await;

    let (started_tx, started_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::unbounded::<io::Result<Bytes>>();
    let first_body = stream::once(async move {
        let _ = started_tx.send(());
        Ok(Bytes::from_static(b"1234"))
    })
    .chain(chunk_rx);

    let first = {
        let app = app.clone();
        let req = Request::builder()
            .method("PATCH")
            .uri(&location)
            .header("Tus-Resumable", "1.0.0")
            .header("Content-Type", OFFSET_STREAM)
            .header("Upload-Offset", "0")
            .body(Body::from_stream(first_body))
            .unwrap();
        tokio::spawn(async move { app.oneshot(req).await.unwrap() })
    };
    started_rx.await.unwrap();

    let res = send(&app, patch(&location, 0, b"zzzz")).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    chunk_tx.unbounded_send(Ok(Bytes::from_static(b"5678"))).unwrap();
    drop(chunk_tx);
    let res = first.await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&res, "upload-offset"), Some("8"));

    let res = send(
        &app,
        Request::builder()
            .method("GET")
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"12345678");
}

#[tokio::test]
async fn deferred_creation_with_empty_chunked_body_is_accepted() {
    let (app, _dir) = file_app(TusSettings::default()).await;
    let deferred_post = |body: Body| {
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("Tus-Resumable", "1.0.0")
            .header("Upload-Defer-Length", "1")
            .header("Content-Type", OFFSET_STREAM)
            .body(body)
            .unwrap()
    };

    let empty = stream::iter(Vec::<io::Result<Bytes>>::new());
    let res = send(&app, deferred_post(Body::from_stream(empty))).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(header(&res, "upload-offset"), Some("0"));
    let location = header(&res, "location").unwrap().to_string();
    assert_eq!(header(&head(&app, &location).await, "upload-defer-length"), Some("1"));

    let bytes = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"early"))]);
    let res = send(&app, deferred_post(Body::from_stream(bytes))).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
