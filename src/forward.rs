//! Pooled loopback forwarding to tenant listeners
//!
//! In loopback mode every dispatched request crosses the loopback
//! interface to the tenant's own port. Connections are pooled per port so
//! busy tenants reuse sockets instead of handshaking per request.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for forwarding operations
#[derive(Debug)]
pub enum ForwardError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building the loopback request
    RequestBuild(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Client(e) => write!(f, "Client error: {}", e),
            ForwardError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<hyper_util::client::legacy::Error> for ForwardError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ForwardError::Client(err)
    }
}

/// Statistics for the forwarder
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Total number of requests sent over loopback
    pub total_requests: AtomicU64,
    /// Requests that failed at the transport level
    pub failed_requests: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the loopback connection pool
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Maximum idle connections per tenant port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A pooled HTTP client for tenant loopback listeners
pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<ForwardStats>,
    config: ForwardConfig,
}

impl Forwarder {
    /// Create a forwarder with the given pool configuration
    pub fn new(config: ForwardConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Loopback pool initialized"
        );

        Self {
            client,
            stats: Arc::new(ForwardStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    /// Get forwarding statistics
    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the tenant listening on `port`
    ///
    /// The original Host header is dropped and rewritten to `localhost`;
    /// the tenant never sees the multi-tenant Host. Everything else,
    /// including the forwarded-* headers set by the dispatcher, is copied
    /// through, and the response streams back verbatim.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            port,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }
        builder = builder.header(hyper::header::HOST, HeaderValue::from_static("localhost"));

        let loopback_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(loopback_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_config_default() {
        let config = ForwardConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_forward_stats() {
        let stats = ForwardStats::default();

        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_failed_requests(), 0);

        stats.record_request();
        assert_eq!(stats.get_total_requests(), 1);

        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[test]
    fn test_forwarder_creation() {
        let config = ForwardConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let forwarder = Forwarder::new(config);
        assert_eq!(forwarder.config().max_idle_per_host, 5);
        assert_eq!(forwarder.config().idle_timeout, Duration::from_secs(30));
        assert_eq!(forwarder.stats().get_total_requests(), 0);
    }
}
