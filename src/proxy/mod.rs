//! Edge proxy: the single public entry point of the deployment.
//!
//! ## Routes
//! - `GET  /health`          — backend `/health`, never rate limited or logged
//! - `ANY  /api/upload`      — backend `/upload`, upload budget, long timeout
//! - `ANY  /api/{*rest}`     — backend `/{rest}`, API budget
//! - `GET  /imagens/{*path}` — backend `/imagens/{path}`, cached for a day
//! - anything else           — static frontend with SPA fallback to `index.html`
//!
//! Every response carries baseline security headers and is gzip-compressed
//! when the client accepts it.

pub mod config;
pub mod forward;
pub mod rate_limit;

use crate::{errors::AppError, handlers::image_handlers::IMAGE_CACHE_CONTROL, shutdown::shutdown_signal};
use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    middleware::{Next, from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use config::{ProxyConfig, ProxyConfigError};
use forward::Upstream;
use rate_limit::RateLimiter;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::net::TcpListener;
use tower::ServiceExt;
use tower_http::{
    compression::CompressionLayer,
    limit::RequestBodyLimitLayer,
    services::{ServeDir, ServeFile},
    set_header::SetResponseHeaderLayer,
};
use tracing::{info, warn};

/// Cache policy for fingerprinted frontend assets.
pub const ASSET_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

const ASSET_EXTENSIONS: [&str; 10] = [
    "js", "css", "png", "jpg", "jpeg", "gif", "ico", "svg", "woff", "woff2",
];

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the proxy's handlers share. Owns the rate-limit buckets.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    upstream: Upstream,
    api_limiter: Arc<RateLimiter>,
    upload_limiter: Arc<RateLimiter>,
    static_files: ServeDir<ServeFile>,
    listen_port: u16,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyConfigError> {
        let backend = config.backend_uri()?;
        let listen_port = config.listen_addr()?.port();
        let index = config.static_root.join("index.html");
        if !index.is_file() {
            warn!("{} is missing; SPA fallback will return 404", index.display());
        }

        Ok(Self {
            upstream: Upstream::new(&backend, config.timeouts.connect()),
            api_limiter: Arc::new(RateLimiter::new(&config.api_limit)),
            upload_limiter: Arc::new(RateLimiter::new(&config.upload_limit)),
            static_files: ServeDir::new(&config.static_root).fallback(ServeFile::new(index)),
            listen_port,
            config: Arc::new(config),
        })
    }

    fn prune_buckets(&self) {
        self.api_limiter.prune();
        self.upload_limiter.prune();
    }
}

/// Build the proxy router with its state and middleware.
pub fn router(state: ProxyState) -> Router {
    let uploads = Router::new()
        .route("/api/upload", any(forward_upload))
        .route_layer(from_fn_with_state(state.clone(), limit_uploads));
    let api = Router::new()
        .route("/api", any(forward_api))
        .route("/api/{*rest}", any(forward_api))
        .route_layer(from_fn_with_state(state.clone(), limit_api));

    Router::new()
        .route("/health", get(forward_health))
        .route("/imagens/{*path}", get(forward_images).head(forward_images))
        .merge(uploads)
        .merge(api)
        .fallback(static_files)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_bytes()))
        .layer(CompressionLayer::new())
        .layer(security_header("x-frame-options", "SAMEORIGIN"))
        .layer(security_header("x-content-type-options", "nosniff"))
        .layer(security_header("x-xss-protection", "1; mode=block"))
        .layer(security_header("referrer-policy", "strict-origin-when-cross-origin"))
        .layer(from_fn(access_log))
        .with_state(state)
}

fn security_header(name: &'static str, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::if_not_present(
        HeaderName::from_static(name),
        HeaderValue::from_static(value),
    )
}

/// Load, validate and serve until SIGTERM/Ctrl+C.
pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    config.validate()?;
    let addr = config.listen_addr()?;
    let state = ProxyState::new(config)?;

    let pruner = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            pruner.prune_buckets();
        }
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding proxy listener on {}", addr))?;
    info!(
        "Proxy listening on http://{} (backend {}, static {})",
        listener.local_addr()?,
        state.config.backend,
        state.config.static_root.display()
    );

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Proxy shutdown complete");
    Ok(())
}

fn client_addr(request: &Request) -> SocketAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
}

/// Path plus query of the incoming request, with `prefix` removed.
fn upstream_target(request: &Request, prefix: &str) -> String {
    let path = request.uri().path();
    let path = path.strip_prefix(prefix).unwrap_or(path);
    let path = if path.is_empty() { "/" } else { path };
    match request.uri().query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    }
}

async fn forward_health(State(state): State<ProxyState>, request: Request) -> Response {
    let client = client_addr(&request);
    state
        .upstream
        .forward(request, "/health", client, state.listen_port, state.config.timeouts.read())
        .await
}

async fn forward_upload(State(state): State<ProxyState>, request: Request) -> Response {
    let client = client_addr(&request);
    let target = upstream_target(&request, "/api/upload");
    let target = format!("/upload{}", target.trim_start_matches('/'));
    state
        .upstream
        .forward(request, &target, client, state.listen_port, state.config.timeouts.upload_read())
        .await
}

async fn forward_api(State(state): State<ProxyState>, request: Request) -> Response {
    let client = client_addr(&request);
    let target = upstream_target(&request, "/api");
    state
        .upstream
        .forward(request, &target, client, state.listen_port, state.config.timeouts.read())
        .await
}

async fn forward_images(State(state): State<ProxyState>, request: Request) -> Response {
    let client = client_addr(&request);
    let target = upstream_target(&request, "");
    let mut response = state
        .upstream
        .forward(request, &target, client, state.listen_port, state.config.timeouts.read())
        .await;
    if response.status().is_success() {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(IMAGE_CACHE_CONTROL),
        );
    }
    response
}

/// Serve the frontend; unknown paths fall back to `index.html`.
async fn static_files(State(state): State<ProxyState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let response = state
        .static_files
        .clone()
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    let mut response = response.map(Body::new);

    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"));
    if response.status() == StatusCode::OK && !is_html && is_fingerprinted_asset(&path) {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(ASSET_CACHE_CONTROL),
        );
    }
    response
}

fn is_fingerprinted_asset(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| ASSET_EXTENSIONS.contains(&ext.as_str()))
}

async fn limit_api(State(state): State<ProxyState>, request: Request, next: Next) -> Response {
    enforce(&state.api_limiter, "api", request, next).await
}

async fn limit_uploads(State(state): State<ProxyState>, request: Request, next: Next) -> Response {
    enforce(&state.upload_limiter, "upload", request, next).await
}

async fn enforce(limiter: &RateLimiter, zone: &'static str, request: Request, next: Next) -> Response {
    let client = client_addr(&request).ip();
    if limiter.check(client) {
        next.run(request).await
    } else {
        warn!(client = %client, zone, "rate limit exceeded");
        AppError::new(StatusCode::TOO_MANY_REQUESTS, "too many requests").into_response()
    }
}

/// Access log. `/health` is excluded so liveness polling stays quiet.
async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client = client_addr(&request);
    let start = Instant::now();

    let response = next.run(request).await;
    if uri.path() != "/health" {
        info!(
            client = %client.ip(),
            method = %method,
            uri = %uri,
            status = response.status().as_u16(),
            duration_ms = start.elapsed().as_millis(),
            "access"
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_detection_uses_extension() {
        assert!(is_fingerprinted_asset("/assets/app.3f9a1c.js"));
        assert!(is_fingerprinted_asset("/fonts/inter.WOFF2"));
        assert!(!is_fingerprinted_asset("/index.html"));
        assert!(!is_fingerprinted_asset("/batches/12"));
    }

    #[test]
    fn api_prefix_is_stripped_and_query_kept() {
        let request = Request::builder()
            .uri("/api/imagens/a.jpg?v=2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(upstream_target(&request, "/api"), "/imagens/a.jpg?v=2");

        let request = Request::builder().uri("/api").body(Body::empty()).unwrap();
        assert_eq!(upstream_target(&request, "/api"), "/");
    }
}
