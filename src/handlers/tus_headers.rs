//! Protocol header names and the per-request view of them.

use crate::{
    errors::AppError,
    models::{checksum::Checksum, extension::Extension, metadata::Metadata},
    state::TusSettings,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use chrono::{DateTime, Utc};

/// The only protocol version this server speaks.
pub const TUS_VERSION: &str = "1.0.0";

/// Media type every PATCH body (and creation-with-upload body) must declare.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const TUS_CHECKSUM_ALGORITHM: HeaderName = HeaderName::from_static("tus-checksum-algorithm");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_CHECKSUM: HeaderName = HeaderName::from_static("upload-checksum");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");
pub const METHOD_OVERRIDE: HeaderName = HeaderName::from_static("x-http-method-override");
pub const FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Protocol headers of one request, parsed once up front.
///
/// Absent headers are `None`; malformed ones fail the whole request with 400.
#[derive(Debug, Default)]
pub struct UploadRequest {
    pub upload_length: Option<u64>,
    pub defer_length: bool,
    pub metadata: Option<Metadata>,
    pub upload_offset: Option<u64>,
    pub offset_stream: bool,
    pub content_length: Option<u64>,
    pub checksum: Option<Checksum>,
}

impl UploadRequest {
    pub fn from_headers(headers: &HeaderMap, settings: &TusSettings) -> Result<Self, AppError> {
        let upload_length = optional_u64(headers, &UPLOAD_LENGTH)?;
        let upload_offset = optional_u64(headers, &UPLOAD_OFFSET)?;
        let content_length = optional_u64(headers, &header::CONTENT_LENGTH)?;

        let defer_length = match header_str(headers, &UPLOAD_DEFER_LENGTH)? {
            None => false,
            Some("1") if settings.supports(Extension::CreationDeferLength) => true,
            Some("1") => {
                return Err(AppError::bad_request(
                    "deferred upload length is not supported",
                ));
            }
            Some(other) => {
                return Err(AppError::bad_request(format!(
                    "Upload-Defer-Length must be 1, got `{}`",
                    other
                )));
            }
        };

        let metadata = header_str(headers, &UPLOAD_METADATA)?
            .map(Metadata::parse)
            .transpose()
            .map_err(|e| AppError::bad_request(e.to_string()))?;

        let checksum = if settings.supports(Extension::Checksum) {
            header_str(headers, &UPLOAD_CHECKSUM)?
                .map(str::parse::<Checksum>)
                .transpose()
                .map_err(|e| AppError::bad_request(e.to_string()))?
        } else {
            None
        };

        Ok(Self {
            upload_length,
            defer_length,
            metadata,
            upload_offset,
            offset_stream: is_offset_octet_stream(headers),
            content_length,
            checksum,
        })
    }

    /// Whether the request may carry upload bytes, judged from its headers.
    /// Without `Content-Length` this is only a possibility; the body may still
    /// turn out empty.
    pub fn has_body(&self) -> bool {
        self.offset_stream && self.content_length != Some(0)
    }
}

/// Reject requests that do not speak our protocol version.
pub fn check_version(headers: &HeaderMap) -> Result<(), AppError> {
    match headers.get(TUS_RESUMABLE) {
        Some(value) if value.as_bytes() == TUS_VERSION.as_bytes() => Ok(()),
        Some(_) | None => Err(AppError::new(
            StatusCode::PRECONDITION_FAILED,
            format!("Tus-Resumable {} is required", TUS_VERSION),
        )
        .with_header(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION))),
    }
}

/// The verb to dispatch on once `X-HTTP-Method-Override` is honoured.
pub fn effective_method(method: &Method, headers: &HeaderMap) -> Method {
    headers
        .get(METHOD_OVERRIDE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Method::from_bytes(v.trim().to_ascii_uppercase().as_bytes()).ok())
        .unwrap_or_else(|| method.clone())
}

pub fn is_offset_octet_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
}

/// RFC 7231 IMF-fixdate, as `Upload-Expires` requires.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<Option<&'a str>, AppError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map(str::trim)
                .map_err(|_| AppError::bad_request(format!("{} is not valid ASCII", name)))
        })
        .transpose()
}

/// Digits only: no sign, no whitespace inside, no exponent.
fn optional_u64(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, AppError> {
    let Some(raw) = header_str(headers, name)? else {
        return Ok(None);
    };
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::bad_request(format!(
            "{} must be a non-negative integer",
            name
        )));
    }
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| AppError::bad_request(format!("{} is out of range", name)))
}
