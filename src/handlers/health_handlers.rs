//! Health & readiness handlers.
//!
//! - GET /health -> simple liveness ("ok"), polled by the entrypoint
//! - GET /ready  -> readiness that checks the storage root with a disk round trip

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /health`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
/// This endpoint must stay cheap and never perform I/O.
pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            service: "upload-service",
        }),
    )
}

/// `GET /ready`
///
/// Performs a write/read/delete of a probe file under the storage root.
/// HTTP 200 when the check passes, HTTP 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let disk_check = match state.storage.probe_writable().await {
        Ok(()) => CheckStatus {
            ok: true,
            error: None,
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(e.to_string()),
        },
    };

    let overall_ok = disk_check.ok;
    let mut checks = HashMap::new();
    checks.insert("disk", disk_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
