//! Defines routes for the tus upload collection and its resources.
//!
//! ## Structure
//! - **Collection** (`{base}`, default `/files`)
//!   - `OPTIONS`: server capabilities
//!   - `POST`: create an upload
//!
//! - **Upload resource** (`{base}/{id}`)
//!   - `HEAD`: current offset and length
//!   - `PATCH`: append bytes at `Upload-Offset`
//!   - `DELETE`: terminate
//!   - `GET`: download a completed upload
//!
//! Verbs are dispatched inside the handlers so `X-HTTP-Method-Override` can
//! replace the verb the request arrived with. Every response, fallbacks
//! included, is stamped with `Tus-Resumable`.

use crate::{
    errors::AppError,
    handlers::{
        health_handlers::{healthz, readyz},
        tus_headers::{TUS_RESUMABLE, TUS_VERSION},
        upload_handlers::{collection, upload_resource},
    },
    state::AppState,
};
use axum::{
    Router,
    http::HeaderValue,
    middleware::map_response,
    response::Response,
    routing::{any, get},
};

/// Build the router for the upload collection mounted at `base_path`.
///
/// `base_path` is expected in normalized form (see
/// [`crate::state::normalize_base_path`]); the empty string mounts at `/`.
pub fn routes(base_path: &str) -> Router<AppState> {
    let collection_path = if base_path.is_empty() {
        "/".to_string()
    } else {
        base_path.to_string()
    };

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(&collection_path, any(collection))
        .route(&format!("{}/{{id}}", base_path), any(upload_resource))
        .fallback(not_found)
        .layer(map_response(stamp_tus_resumable))
}

/// Router with state attached, ready to serve.
pub fn app(state: AppState) -> Router {
    let base_path = state.settings.base_path.clone();
    routes(&base_path).with_state(state)
}

async fn not_found() -> AppError {
    AppError::not_found("no such resource")
}

async fn stamp_tus_resumable(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}
