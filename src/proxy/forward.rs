//! Upstream forwarding for the edge proxy.

use crate::errors::AppError;
use crate::services::public_url::{X_FORWARDED_HOST, X_FORWARDED_PORT, X_FORWARDED_PROTO};
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tracing::{debug, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Pooled HTTP client bound to the backend origin.
#[derive(Clone)]
pub struct Upstream {
    client: Client<HttpConnector, Body>,
    origin: String,
}

impl Upstream {
    pub fn new(backend: &Uri, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        let origin = backend.to_string().trim_end_matches('/').to_string();
        Self { client, origin }
    }

    /// Send `request` to `target` (path plus optional query) on the backend.
    ///
    /// Upstream connection failures become 502, exceeding `timeout` while
    /// waiting for the response head becomes 504.
    pub async fn forward(
        &self,
        request: Request,
        target: &str,
        client: SocketAddr,
        listen_port: u16,
        timeout: Duration,
    ) -> Response {
        let (mut parts, body) = request.into_parts();

        let uri: Uri = match format!("{}{}", self.origin, target).parse() {
            Ok(uri) => uri,
            Err(err) => {
                debug!("rejecting unforwardable target {}: {}", target, err);
                return AppError::bad_request("invalid request target").into_response();
            }
        };
        parts.uri = uri;
        prepare_forward_headers(&mut parts.headers, client.ip(), listen_port);

        let upstream_request = Request::from_parts(parts, body);
        match tokio::time::timeout(timeout, self.client.request(upstream_request)).await {
            Ok(Ok(response)) => {
                let mut response = response.map(Body::new);
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Ok(Err(err)) => {
                warn!(target, error = %err, "upstream request failed");
                AppError::new(StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
            }
            Err(_) => {
                warn!(target, timeout_secs = timeout.as_secs(), "upstream timed out");
                AppError::new(StatusCode::GATEWAY_TIMEOUT, "upstream timed out").into_response()
            }
        }
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rewrite request headers for the backend.
///
/// `X-Forwarded-Proto/Host/Port` already set by an outer proxy are kept;
/// otherwise this proxy's own view (`http`, `Host`, listen port) is used.
/// The listen port is only added alongside a host taken from `Host`.
pub fn prepare_forward_headers(headers: &mut HeaderMap, client: IpAddr, listen_port: u16) {
    strip_hop_by_hop(headers);

    let client_ip = client.to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip.clone(),
    };
    set_header(headers, X_FORWARDED_FOR, &forwarded_for);
    set_header(headers, X_REAL_IP, &client_ip);

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    // The listen port only describes the origin when the host is ours too;
    // an outer proxy's host without a port means its default port.
    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = headers.get(header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if !headers.contains_key(X_FORWARDED_PORT) {
            headers.insert(X_FORWARDED_PORT, HeaderValue::from(listen_port));
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
