//! Public link construction for stored images.
//!
//! The externally visible origin is, in order of preference:
//! 1. the configured `BASE_URL` override,
//! 2. `X-Forwarded-Proto/Host/Port` set by the proxy chain,
//! 3. the request's own `Host` header,
//! 4. the address the backend is bound to.

use crate::config::BackendConfig;
use axum::http::{HeaderMap, header};

pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PORT: &str = "x-forwarded-port";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        // Proxies may append: "https, http". The first hop is the client-facing one.
        .map(|v| v.split(',').next().unwrap_or("").trim())
        .filter(|v| !v.is_empty())
}

/// Scheme, host and optional port of the public origin, without trailing `/`.
pub fn base_url(config: &BackendConfig, headers: &HeaderMap) -> String {
    if let Some(base) = &config.base_url {
        return base.clone();
    }

    if let Some(host) = header_str(headers, X_FORWARDED_HOST) {
        let scheme = header_str(headers, X_FORWARDED_PROTO).unwrap_or("http");
        let mut authority = host.to_string();
        if let Some(port) = header_str(headers, X_FORWARDED_PORT) {
            if !host.contains(':') && !matches!(port, "80" | "443") {
                authority = format!("{}:{}", host, port);
            }
        }
        return format!("{}://{}", scheme, authority);
    }

    match header_str(headers, header::HOST.as_str()) {
        Some(host) => format!("http://{}", host),
        None => format!("http://{}", config.addr()),
    }
}

/// Absolute link to an image stored at `relative_path`.
pub fn image_link(base: &str, relative_path: &str) -> String {
    format!("{}/imagens/{}", base.trim_end_matches('/'), relative_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn forwarded_headers_define_the_origin() {
        let cfg = BackendConfig::default();
        let h = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "example.com"),
            ("host", "127.0.0.1:8002"),
        ]);
        assert_eq!(base_url(&cfg, &h), "https://example.com");
        assert_eq!(
            image_link(&base_url(&cfg, &h), "batch1/foto.jpg"),
            "https://example.com/imagens/batch1/foto.jpg"
        );
    }

    #[test]
    fn non_default_forwarded_port_is_appended() {
        let cfg = BackendConfig::default();
        let h = headers(&[
            ("x-forwarded-proto", "http"),
            ("x-forwarded-host", "example.com"),
            ("x-forwarded-port", "8080"),
        ]);
        assert_eq!(base_url(&cfg, &h), "http://example.com:8080");

        let h = headers(&[
            ("x-forwarded-host", "example.com:9000"),
            ("x-forwarded-port", "8080"),
        ]);
        assert_eq!(base_url(&cfg, &h), "http://example.com:9000");

        let h = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "example.com"),
            ("x-forwarded-port", "443"),
        ]);
        assert_eq!(base_url(&cfg, &h), "https://example.com");
    }

    #[test]
    fn override_wins_and_host_header_is_fallback() {
        let cfg = BackendConfig {
            base_url: Some("https://cdn.example.com".into()),
            ..BackendConfig::default()
        };
        let h = headers(&[("x-forwarded-host", "example.com")]);
        assert_eq!(base_url(&cfg, &h), "https://cdn.example.com");

        let cfg = BackendConfig::default();
        let h = headers(&[("host", "localhost:8002")]);
        assert_eq!(base_url(&cfg, &h), "http://localhost:8002");
        assert_eq!(base_url(&cfg, &HeaderMap::new()), "http://0.0.0.0:8002");
    }
}
