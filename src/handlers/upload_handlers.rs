//! tus protocol handlers.
//!
//! Two dispatchers are mounted by the router: [`collection`] for the base path
//! and [`upload_resource`] for `{base}/{id}`. Both resolve the effective verb
//! (honouring `X-HTTP-Method-Override`) before validating anything else.

use crate::{
    errors::AppError,
    handlers::tus_headers::{
        FORWARDED_PROTO, TUS_CHECKSUM_ALGORITHM, TUS_EXTENSION, TUS_MAX_SIZE, TUS_VERSION,
        TUS_VERSION_HEADER, UPLOAD_DEFER_LENGTH, UPLOAD_EXPIRES, UPLOAD_LENGTH, UPLOAD_METADATA,
        UPLOAD_OFFSET, UploadRequest, check_version, effective_method, http_date,
        is_offset_octet_stream,
    },
    models::{
        checksum::{Checksum, ChecksumAlgorithm},
        extension::Extension,
        upload::{NewUpload, Upload, is_valid_id},
    },
    services::store::{ByteStream, DataStore},
    state::{AppState, TusSettings},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use std::{io, sync::Arc};
use tracing::{debug, error, info, warn};

/// `{base}`: OPTIONS and POST. Anything addressing an upload needs an id.
pub async fn collection(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let method = effective_method(&method, &headers);
    match method {
        Method::OPTIONS => Ok(options(&state.settings)),
        Method::POST => {
            check_version(&headers)?;
            create_upload(&state, &headers, body).await
        }
        Method::HEAD | Method::PATCH | Method::DELETE | Method::GET => {
            Err(AppError::not_found("request path does not name an upload"))
        }
        _ => Err(method_not_allowed("OPTIONS, POST")),
    }
}

/// `{base}/{id}`: everything that acts on one upload.
pub async fn upload_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let method = effective_method(&method, &headers);
    match method {
        Method::OPTIONS => Ok(options(&state.settings)),
        Method::GET => download(&state, &id).await,
        Method::HEAD => {
            check_version(&headers)?;
            head_upload(&state, &id).await
        }
        Method::PATCH => {
            check_version(&headers)?;
            patch_upload(&state, &id, &headers, body).await
        }
        Method::DELETE if state.settings.supports(Extension::Termination) => {
            check_version(&headers)?;
            terminate_upload(&state, &id).await
        }
        _ => Err(method_not_allowed(allowed_on_resource(&state.settings))),
    }
}

/// OPTIONS: advertise version, extensions and limits.
fn options(settings: &TusSettings) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
    if let Ok(value) = HeaderValue::from_str(&settings.extensions.header_value()) {
        headers.insert(TUS_EXTENSION, value);
    }
    if let Some(max) = settings.max_size {
        headers.insert(TUS_MAX_SIZE, HeaderValue::from(max));
    }
    if settings.supports(Extension::Checksum) {
        if let Ok(value) = HeaderValue::from_str(&ChecksumAlgorithm::header_value()) {
            headers.insert(TUS_CHECKSUM_ALGORITHM, value);
        }
    }
    (StatusCode::NO_CONTENT, headers).into_response()
}

/// POST: create an upload, optionally with its first chunk.
async fn create_upload(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let settings = &state.settings;
    let req = UploadRequest::from_headers(headers, settings)?;

    let length = match (req.upload_length, req.defer_length) {
        (Some(_), true) => {
            return Err(AppError::bad_request(
                "Upload-Length and Upload-Defer-Length are mutually exclusive",
            ));
        }
        (None, false) => {
            return Err(AppError::bad_request(
                "Upload-Length or Upload-Defer-Length: 1 is required",
            ));
        }
        (length, _) => length,
    };
    if let (Some(length), Some(max)) = (length, settings.max_size) {
        if length > max {
            return Err(AppError::too_large(format!(
                "upload length {} exceeds the maximum of {} bytes",
                length, max
            )));
        }
    }

    let with_upload = req.has_body();
    if with_upload {
        if !settings.supports(Extension::CreationWithUpload) {
            return Err(AppError::bad_request("creation-with-upload is not supported"));
        }
        match (length, req.content_length) {
            // A chunked body of unknown size is judged by what actually arrives.
            (None, Some(_)) => {
                return Err(AppError::bad_request(
                    "upload length must be declared before sending bytes",
                ));
            }
            (Some(length), Some(sent)) if sent > length => {
                return Err(AppError::too_large(format!(
                    "body of {} bytes exceeds the upload length of {}",
                    sent, length
                )));
            }
            _ => {}
        }
    }

    let upload = state
        .store
        .create(NewUpload {
            length,
            metadata: req.metadata.unwrap_or_default(),
        })
        .await?;

    let mut offset = upload.offset;
    if with_upload {
        match append_detached(state.store.clone(), &upload.id, 0, body, req.checksum).await {
            Ok(new_offset) => offset = new_offset,
            Err(err) if upload.length.is_none() => {
                // Bytes arrived before any length was declared.
                state.store.remove(&upload.id).await?;
                return Err(err);
            }
            Err(err) => {
                // The upload exists either way; report what was kept.
                warn!(upload_id = %upload.id, error = %err, "Initial chunk was not fully stored");
                offset = state.store.get_offset(&upload.id).await?.offset;
            }
        }
    }

    let mut out = HeaderMap::new();
    let location = location(headers, &settings.upload_path(&upload.id));
    out.insert(
        header::LOCATION,
        HeaderValue::from_str(&location)
            .map_err(|_| AppError::internal("could not build upload location"))?,
    );
    if with_upload {
        out.insert(UPLOAD_OFFSET, HeaderValue::from(offset));
    }
    insert_expires(&mut out, settings, &Upload { offset, ..upload.clone() });

    info!(upload_id = %upload.id, length = ?length, offset, "Upload created");
    Ok((StatusCode::CREATED, out).into_response())
}

/// HEAD: report the durable offset.
async fn head_upload(state: &AppState, id: &str) -> Result<Response, AppError> {
    let upload = load_live(state, id).await?;

    let mut out = HeaderMap::new();
    out.insert(UPLOAD_OFFSET, HeaderValue::from(upload.offset));
    match upload.length {
        Some(length) => {
            out.insert(UPLOAD_LENGTH, HeaderValue::from(length));
        }
        None => {
            out.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
        }
    }
    if !upload.metadata.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&upload.metadata.encode()) {
            out.insert(UPLOAD_METADATA, value);
        }
    }
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    insert_expires(&mut out, &state.settings, &upload);

    Ok((StatusCode::OK, out).into_response())
}

/// PATCH: append the body at `Upload-Offset`.
async fn patch_upload(
    state: &AppState,
    id: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let settings = &state.settings;
    if !is_offset_octet_stream(headers) {
        return Err(AppError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/offset+octet-stream",
        ));
    }
    let req = UploadRequest::from_headers(headers, settings)?;
    let offset = req
        .upload_offset
        .ok_or_else(|| AppError::bad_request("Upload-Offset header is required"))?;

    let mut upload = load_live(state, id).await?;
    if upload.offset != offset {
        return Err(AppError::conflict(format!(
            "Upload-Offset {} does not match the current offset {}",
            offset, upload.offset
        )));
    }

    if let Some(length) = req.upload_length {
        match upload.length {
            None => {
                if let Some(max) = settings.max_size {
                    if length > max {
                        return Err(AppError::too_large(format!(
                            "upload length {} exceeds the maximum of {} bytes",
                            length, max
                        )));
                    }
                }
                upload = state.store.declare_length(id, length).await?;
                info!(upload_id = %id, length, "Deferred length declared");
            }
            Some(current) if current != length => {
                return Err(AppError::bad_request(
                    "Upload-Length cannot change once declared",
                ));
            }
            Some(_) => {}
        }
    }

    if let Some(sent) = req.content_length.filter(|n| *n > 0) {
        match upload.remaining() {
            None => {
                return Err(AppError::bad_request(
                    "upload length must be declared before sending bytes",
                ));
            }
            Some(remaining) if sent > remaining => {
                return Err(AppError::too_large(format!(
                    "body of {} bytes exceeds the {} bytes remaining",
                    sent, remaining
                )));
            }
            Some(_) => {}
        }
    }

    let new_offset =
        append_detached(state.store.clone(), id, offset, body, req.checksum).await?;
    debug!(upload_id = %id, from = offset, to = new_offset, "Chunk stored");
    if upload.length == Some(new_offset) {
        info!(upload_id = %id, length = new_offset, "Upload complete");
    }

    let mut out = HeaderMap::new();
    out.insert(UPLOAD_OFFSET, HeaderValue::from(new_offset));
    insert_expires(
        &mut out,
        settings,
        &Upload {
            offset: new_offset,
            ..upload
        },
    );
    Ok((StatusCode::NO_CONTENT, out).into_response())
}

/// DELETE: remove payload and record.
async fn terminate_upload(state: &AppState, id: &str) -> Result<Response, AppError> {
    let upload = load(state, id).await?;
    state.store.remove(&upload.id).await?;
    info!(upload_id = %id, "Upload terminated");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET: stream a completed upload back.
async fn download(state: &AppState, id: &str) -> Result<Response, AppError> {
    let upload = load(state, id).await?;
    if !upload.is_complete() {
        return Err(AppError::conflict("upload is not complete"));
    }
    let (upload, stream) = state.store.read(id).await?;

    let content_type = upload
        .metadata
        .get_str("filetype")
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));

    let mut out = HeaderMap::new();
    out.insert(header::CONTENT_TYPE, content_type);
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(upload.offset));
    Ok((StatusCode::OK, out, Body::from_stream(stream)).into_response())
}

async fn load(state: &AppState, id: &str) -> Result<Upload, AppError> {
    if !is_valid_id(id) {
        return Err(AppError::not_found(format!("upload `{}` not found", id)));
    }
    Ok(state.store.get_offset(id).await?)
}

/// Like [`load`], but an incomplete upload past its retention is gone.
async fn load_live(state: &AppState, id: &str) -> Result<Upload, AppError> {
    let upload = load(state, id).await?;
    if let Some(retention) = state.settings.expiration {
        if upload.is_expired(retention, Utc::now()) {
            return Err(AppError::gone(format!("upload `{}` has expired", id)));
        }
    }
    Ok(upload)
}

/// Run the append on its own task so a dropped connection still commits the
/// flushed prefix instead of cancelling the store mid-write.
async fn append_detached(
    store: Arc<dyn DataStore>,
    id: &str,
    offset: u64,
    body: Body,
    checksum: Option<Checksum>,
) -> Result<u64, AppError> {
    let stream: ByteStream = body.into_data_stream().map_err(io::Error::other).boxed();
    let id = id.to_string();
    let task = tokio::spawn(async move { store.append(&id, offset, stream, checksum).await });

    match task.await {
        Ok(result) => Ok(result?),
        Err(err) => {
            error!(error = %err, "append task failed");
            Err(AppError::internal("append task failed"))
        }
    }
}

fn insert_expires(out: &mut HeaderMap, settings: &TusSettings, upload: &Upload) {
    let Some(retention) = settings.expiration else {
        return;
    };
    if let Some(at) = upload.expires_at(retention) {
        if let Ok(value) = HeaderValue::from_str(&http_date(at)) {
            out.insert(UPLOAD_EXPIRES, value);
        }
    }
}

/// Absolute URL when the request names its host, the bare path otherwise.
fn location(headers: &HeaderMap, path: &str) -> String {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let proto = headers
        .get(FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .filter(|p| matches!(*p, "http" | "https"))
        .unwrap_or("http");
    match host {
        Some(host) => format!("{}://{}{}", proto, host, path),
        None => path.to_string(),
    }
}

fn allowed_on_resource(settings: &TusSettings) -> &'static str {
    if settings.supports(Extension::Termination) {
        "OPTIONS, HEAD, PATCH, DELETE, GET"
    } else {
        "OPTIONS, HEAD, PATCH, GET"
    }
}

fn method_not_allowed(allow: &'static str) -> AppError {
    AppError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        .with_header(header::ALLOW, HeaderValue::from_static(allow))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_prefers_forwarded_proto() {
        let mut headers = HeaderMap::new();
        assert_eq!(location(&headers, "/files/abc"), "/files/abc");

        headers.insert(header::HOST, HeaderValue::from_static("tus.example.org"));
        assert_eq!(
            location(&headers, "/files/abc"),
            "http://tus.example.org/files/abc"
        );

        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("https"));
        assert_eq!(
            location(&headers, "/files/abc"),
            "https://tus.example.org/files/abc"
        );
    }

    #[test]
    fn options_advertises_configuration() {
        let settings = TusSettings::default().with_max_size(1 << 30);
        let res = options(&settings);

        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(res.headers()[TUS_VERSION_HEADER], "1.0.0");
        assert_eq!(res.headers()[TUS_MAX_SIZE], "1073741824");
        assert_eq!(res.headers()[TUS_CHECKSUM_ALGORITHM], "md5,sha256");
        assert!(
            res.headers()[TUS_EXTENSION]
                .to_str()
                .unwrap()
                .contains("creation-defer-length")
        );
    }
}
