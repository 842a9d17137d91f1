//! Subdomain dispatcher, the shared public listener
//!
//! Every tenant is reached through one listener. The leading label of the
//! Host header names the tenant (`about.example.com` routes to `about`),
//! and the request is answered by that tenant's route table, either inside
//! this process or over a loopback hop to the instance's own listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DispatchMode, ServerConfig};
use crate::error::{json_error_response, HostErrorCode};
use crate::forward::{ForwardConfig, Forwarder};
use crate::instance::InstanceState;
use crate::registry::Registry;

/// DNS caps a full hostname at 253 characters
const MAX_HOSTNAME_LEN: usize = 253;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// The public-facing HTTP listener
pub struct Dispatcher {
    bind_addr: SocketAddr,
    domain: Arc<str>,
    mode: DispatchMode,
    request_timeout: Duration,
    registry: Arc<Registry>,
    forwarder: Arc<Forwarder>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Build a dispatcher over `registry`, listening on `bind_addr`
    pub fn new(
        bind_addr: SocketAddr,
        server: &ServerConfig,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let forwarder = Arc::new(Forwarder::new(ForwardConfig {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: server.pool_idle_timeout(),
        }));

        Self {
            bind_addr,
            domain: server.domain.to_ascii_lowercase().into(),
            mode: server.mode,
            request_timeout: server.request_timeout(),
            registry,
            forwarder,
            shutdown_rx,
        }
    }

    /// Accept connections until the shutdown signal flips to true
    pub async fn run(mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("failed to bind dispatcher to {}", self.bind_addr))?;

        info!(
            addr = %self.bind_addr,
            domain = %self.domain,
            mode = ?self.mode,
            "Dispatcher listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let forwarder = Arc::clone(&self.forwarder);
                            let domain = Arc::clone(&self.domain);
                            let mode = self.mode;
                            let request_timeout = self.request_timeout;
                            tokio::spawn(async move {
                                handle_connection(
                                    stream,
                                    remote_addr,
                                    registry,
                                    forwarder,
                                    domain,
                                    mode,
                                    request_timeout,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Dispatcher shutting down");
                        break;
                    }
                }
            }
        }

        let stats = self.forwarder.stats();
        debug!(
            total_requests = stats.get_total_requests(),
            failed_requests = stats.get_failed_requests(),
            "Dispatcher stopped"
        );
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    registry: Arc<Registry>,
    forwarder: Arc<Forwarder>,
    domain: Arc<str>,
    mode: DispatchMode,
    request_timeout: Duration,
) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        let forwarder = Arc::clone(&forwarder);
        let domain = Arc::clone(&domain);
        async move {
            handle_request(
                req,
                registry,
                forwarder,
                domain,
                mode,
                request_timeout,
                remote_addr,
            )
            .await
        }
    });

    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!(error = %e, "Connection error");
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<Registry>,
    forwarder: Arc<Forwarder>,
    domain: Arc<str>,
    mode: DispatchMode,
    request_timeout: Duration,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = match req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
    {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => {
            debug!(request_id, "Rejected request without a Host header");
            return Ok(json_error_response(
                HostErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    let subdomain = match resolve_subdomain(&host, &domain) {
        Ok(label) => label,
        Err(code) => {
            debug!(request_id, host = %host, code = ?code, "Host did not resolve to a tenant");
            let message = match code {
                HostErrorCode::NoSubdomain => "No subdomain to route on",
                HostErrorCode::AmbiguousHost => "Expected exactly one subdomain label",
                _ => "Missing or invalid Host header",
            };
            return Ok(json_error_response(code, message));
        }
    };

    // First trusted hop: overwrite the forwarding headers, never append
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    debug!(
        request_id,
        tenant = %subdomain,
        method = %req.method(),
        path = %req.uri().path(),
        "Dispatching request"
    );

    let instance = match registry.lookup(&subdomain) {
        Some(instance) => instance,
        None => {
            debug!(request_id, tenant = %subdomain, "Unknown tenant");
            return Ok(json_error_response(
                HostErrorCode::UnknownTenant,
                "Unknown or unconfigured tenant",
            ));
        }
    };

    match instance.state() {
        // A failed tenant answers exactly like an absent one
        InstanceState::Failed => {
            warn!(request_id, tenant = %subdomain, "Request for failed tenant");
            return Ok(json_error_response(
                HostErrorCode::UnknownTenant,
                "Unknown or unconfigured tenant",
            ));
        }
        InstanceState::Stopping | InstanceState::Stopped => {
            debug!(request_id, tenant = %subdomain, "Request for stopped tenant");
            return Ok(json_error_response(
                HostErrorCode::TenantStopping,
                "Tenant is shutting down",
            ));
        }
        // In-process dispatch can answer before the loopback listener is up
        InstanceState::Created | InstanceState::Starting
            if mode == DispatchMode::Loopback =>
        {
            debug!(request_id, tenant = %subdomain, "Tenant listener not up yet");
            return Ok(json_error_response(
                HostErrorCode::TenantNotReady,
                "Tenant is not ready yet",
            ));
        }
        _ => {}
    }

    // The tenant always sees itself as localhost
    req.headers_mut()
        .insert(hyper::header::HOST, HeaderValue::from_static("localhost"));

    match mode {
        DispatchMode::InProcess => Ok(instance.serve(req).await),
        DispatchMode::Loopback => {
            let port = instance.port();
            match timeout(request_timeout, forwarder.send_request(req, port)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => {
                    error!(request_id, tenant = %subdomain, port, error = %e, "Loopback forward failed");
                    Ok(json_error_response(
                        HostErrorCode::ForwardFailed,
                        "Failed to reach tenant",
                    ))
                }
                Err(_) => {
                    warn!(
                        request_id,
                        tenant = %subdomain,
                        timeout_secs = request_timeout.as_secs(),
                        "Loopback forward timed out"
                    );
                    Ok(json_error_response(
                        HostErrorCode::RequestTimeout,
                        format!(
                            "Request timed out after {} seconds",
                            request_timeout.as_secs()
                        ),
                    ))
                }
            }
        }
    }
}

/// Extract the tenant label from a Host header value.
///
/// The port suffix is dropped and the parent domain is stripped from the
/// tail; exactly one label must remain. `about.example.com` resolves to
/// `about` under the domain `example.com`, the bare parent domain has
/// nothing to route on, and a host with extra or foreign labels is
/// ambiguous rather than guessed at.
pub fn resolve_subdomain(host: &str, domain: &str) -> Result<String, HostErrorCode> {
    let name = host.split(':').next().unwrap_or(host);
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return Err(HostErrorCode::MissingHostHeader);
    }
    // Alphanumeric, hyphen, and dot only; anything else is dropped before
    // it can reach the logs or a tenant lookup
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(HostErrorCode::MissingHostHeader);
    }

    let name = name.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();

    let labels: Vec<&str> = name.split('.').filter(|l| !l.is_empty()).collect();
    let parent: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();

    let remaining = if labels.len() >= parent.len()
        && labels[labels.len() - parent.len()..] == parent[..]
    {
        &labels[..labels.len() - parent.len()]
    } else {
        &labels[..]
    };

    match remaining {
        [] => Err(HostErrorCode::NoSubdomain),
        [label] => Ok((*label).to_string()),
        _ => Err(HostErrorCode::AmbiguousHost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_simple_subdomain() {
        assert_eq!(
            resolve_subdomain("about.example.com", "example.com"),
            Ok("about".to_string())
        );
    }

    #[test]
    fn test_resolve_strips_port() {
        assert_eq!(
            resolve_subdomain("about.example.com:8080", "example.com"),
            Ok("about".to_string())
        );
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        assert_eq!(
            resolve_subdomain("About.EXAMPLE.com", "example.com"),
            Ok("about".to_string())
        );
        assert_eq!(
            resolve_subdomain("about.example.com", "Example.COM"),
            Ok("about".to_string())
        );
    }

    #[test]
    fn test_resolve_bare_domain_has_no_subdomain() {
        assert_eq!(
            resolve_subdomain("example.com", "example.com"),
            Err(HostErrorCode::NoSubdomain)
        );
        assert_eq!(
            resolve_subdomain("example.com:8080", "example.com"),
            Err(HostErrorCode::NoSubdomain)
        );
    }

    #[test]
    fn test_resolve_nested_subdomain_is_ambiguous() {
        assert_eq!(
            resolve_subdomain("a.b.example.com", "example.com"),
            Err(HostErrorCode::AmbiguousHost)
        );
    }

    #[test]
    fn test_resolve_foreign_domain_is_ambiguous() {
        // No suffix match, so both labels survive the strip
        assert_eq!(
            resolve_subdomain("evil.com", "example.com"),
            Err(HostErrorCode::AmbiguousHost)
        );
    }

    #[test]
    fn test_resolve_single_label_host() {
        assert_eq!(
            resolve_subdomain("intranet", "example.com"),
            Ok("intranet".to_string())
        );
    }

    #[test]
    fn test_resolve_single_label_domain() {
        assert_eq!(
            resolve_subdomain("about.localhost:8080", "localhost"),
            Ok("about".to_string())
        );
        assert_eq!(
            resolve_subdomain("localhost:8080", "localhost"),
            Err(HostErrorCode::NoSubdomain)
        );
    }

    #[test]
    fn test_resolve_rejects_invalid_hosts() {
        assert_eq!(
            resolve_subdomain("", "example.com"),
            Err(HostErrorCode::MissingHostHeader)
        );
        assert_eq!(
            resolve_subdomain(":8080", "example.com"),
            Err(HostErrorCode::MissingHostHeader)
        );
        assert_eq!(
            resolve_subdomain("bad_host.example.com", "example.com"),
            Err(HostErrorCode::MissingHostHeader)
        );
        assert_eq!(
            resolve_subdomain("a b.example.com", "example.com"),
            Err(HostErrorCode::MissingHostHeader)
        );
    }

    #[test]
    fn test_resolve_rejects_oversized_host() {
        let long = format!("{}.example.com", "a".repeat(260));
        assert_eq!(
            resolve_subdomain(&long, "example.com"),
            Err(HostErrorCode::MissingHostHeader)
        );
    }
}
