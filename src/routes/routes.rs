//! Defines the upload backend's routes.
//!
//! ## Structure
//! - `GET  /`                 — service info (routing diagnostics)
//! - `GET  /health`           — liveness, no I/O
//! - `GET  /ready`            — readiness, disk round trip
//! - `POST /upload`           — store an image (multipart or JSON data URL)
//! - `GET  /imagens/{*path}`  — download a stored image
//!
//! The wildcard `*path` carries the folder, e.g. `batch1/foto.jpg`.
//! Behind the edge proxy these are reachable under `/api`, except
//! `/imagens/*` and `/health` which are also proxied at the top level.

use crate::{
    handlers::{
        health_handlers::{health, ready},
        image_handlers::{get_image, service_info, upload_image},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderValue, Method, header},
    middleware::{Next, from_fn_with_state},
    response::Response,
    routing::{get, post},
};
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

/// Slack on top of the file limit for multipart framing and form fields.
const BODY_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Build the backend router with its state and middleware.
pub fn routes(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route(
            "/upload",
            post(upload_image).layer(DefaultBodyLimit::max(upload_body_limit(
                state.config.max_size_bytes(),
            ))),
        )
        .route("/imagens/{*path}", get(get_image))
        .layer(cors)
        .layer(from_fn_with_state(state.clone(), log_requests))
        .with_state(state)
}

/// Request body ceiling for `/upload`.
///
/// JSON uploads carry base64, which inflates the payload by 4/3; the stored
/// file itself is still limited to `max_file_bytes` while streaming.
pub fn upload_body_limit(max_file_bytes: u64) -> usize {
    let limit = max_file_bytes.div_ceil(3) * 4 + BODY_OVERHEAD_BYTES;
    usize::try_from(limit).unwrap_or(usize::MAX)
}

/// CORS allow-list. Origins outside the list get no CORS headers at all.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("skipping invalid CORS origin `{}`", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Request log. Verbose in development, debug-level in production, and
/// silent for the liveness probe.
async fn log_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    if uri.path() == "/health" {
        return response;
    }

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis();
    if state.config.environment.is_development() {
        info!(method = %method, uri = %uri, status, duration_ms, "request");
    } else {
        debug!(method = %method, uri = %uri, status, duration_ms, "request");
    }
    response
}
