//! HTTP liveness probing used while starting the backend.

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Request, Uri};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use std::time::Duration;
use tracing::debug;

/// Retry policy for startup health polling.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Timeout of a single probe.
    pub timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Issues `GET` requests against a fixed health URL.
pub struct HealthProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    url: Uri,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(url: Uri, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            url,
            timeout,
        }
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// True when the endpoint answers 2xx within the timeout.
    pub async fn check(&self) -> bool {
        let request = match Request::get(self.url.clone()).body(Empty::<Bytes>::new()) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "could not build health request");
                return false;
            }
        };

        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!(url = %self.url, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                debug!(url = %self.url, "health probe timed out");
                false
            }
        }
    }
}
