//! Edge proxy configuration.
//!
//! The configuration is a TOML document. The entrypoint renders it from a
//! fixed deployment layout (`ProxyConfig::for_deployment`) and validates it
//! with `imagens proxy --config <file> --check` before starting the proxy.

use axum::http::Uri;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

const RENDERED_HEADER: &str =
    "# Rendered by `imagens supervise` at startup; local edits are overwritten.\n\n";

#[derive(Debug, Error)]
pub enum ProxyConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing proxy config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("rendering proxy config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid proxy config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Second,
    Minute,
}

impl Period {
    fn seconds(self) -> f64 {
        match self {
            Period::Second => 1.0,
            Period::Minute => 60.0,
        }
    }
}

/// One rate-limit zone: `requests` per `per`, plus `burst` queued excess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub per: Period,
    pub burst: u32,
}

impl RateLimitConfig {
    /// General API budget: 30 requests per minute, burst 10.
    pub fn api_default() -> Self {
        Self {
            requests: 30,
            per: Period::Minute,
            burst: 10,
        }
    }

    /// Upload budget: 3 requests per second, burst 15.
    pub fn upload_default() -> Self {
        Self {
            requests: 3,
            per: Period::Second,
            burst: 15,
        }
    }

    pub fn rate_per_second(&self) -> f64 {
        f64::from(self.requests) / self.per.seconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub read_secs: u64,
    /// Applies to `/api/upload`, which may carry large bodies.
    pub upload_read_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            read_secs: 60,
            upload_read_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn upload_read(&self) -> Duration {
        Duration::from_secs(self.upload_read_secs)
    }
}

fn default_max_body_mb() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Socket address to listen on, e.g. `0.0.0.0:80`.
    pub listen: String,
    /// Directory holding the built frontend (`index.html` and assets).
    pub static_root: PathBuf,
    /// Upload backend origin, e.g. `http://127.0.0.1:8002`.
    pub backend: String,
    /// Global request body ceiling, independent of the backend's own limit.
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: u64,
    #[serde(default = "RateLimitConfig::api_default")]
    pub api_limit: RateLimitConfig,
    #[serde(default = "RateLimitConfig::upload_default")]
    pub upload_limit: RateLimitConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl ProxyConfig {
    /// The single-container layout: public port, loopback backend, static root.
    pub fn for_deployment(proxy_port: u16, backend_port: u16, static_root: impl Into<PathBuf>) -> Self {
        Self {
            listen: format!("0.0.0.0:{}", proxy_port),
            static_root: static_root.into(),
            backend: format!("http://127.0.0.1:{}", backend_port),
            max_body_mb: default_max_body_mb(),
            api_limit: RateLimitConfig::api_default(),
            upload_limit: RateLimitConfig::upload_default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ProxyConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ProxyConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ProxyConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Serialize as the TOML document the proxy reads back.
    pub fn render(&self) -> Result<String, ProxyConfigError> {
        Ok(format!("{}{}", RENDERED_HEADER, toml::to_string_pretty(self)?))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ProxyConfigError> {
        self.listen
            .parse()
            .map_err(|_| ProxyConfigError::Invalid(format!("listen `{}` is not host:port", self.listen)))
    }

    /// Parsed backend origin. Only plain `http://host:port` is accepted.
    pub fn backend_uri(&self) -> Result<Uri, ProxyConfigError> {
        let invalid = || ProxyConfigError::Invalid(format!("backend `{}` must be http://host:port", self.backend));
        let uri: Uri = self.backend.parse().map_err(|_| invalid())?;
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(invalid());
        }
        if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
            return Err(invalid());
        }
        Ok(uri)
    }

    pub fn max_body_bytes(&self) -> usize {
        usize::try_from(self.max_body_mb * 1024 * 1024).unwrap_or(usize::MAX)
    }

    /// Check everything the proxy needs before it binds.
    pub fn validate(&self) -> Result<(), ProxyConfigError> {
        self.listen_addr()?;
        self.backend_uri()?;

        if !self.static_root.is_dir() {
            return Err(ProxyConfigError::Invalid(format!(
                "static_root `{}` is not a directory",
                self.static_root.display()
            )));
        }
        if self.max_body_mb == 0 {
            return Err(ProxyConfigError::Invalid("max_body_mb must be positive".into()));
        }
        for (zone, limit) in [("api_limit", &self.api_limit), ("upload_limit", &self.upload_limit)] {
            if limit.requests == 0 {
                return Err(ProxyConfigError::Invalid(format!("{}.requests must be positive", zone)));
            }
        }
        let t = &self.timeouts;
        if t.connect_secs == 0 || t.read_secs == 0 || t.upload_read_secs == 0 {
            return Err(ProxyConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }
}
