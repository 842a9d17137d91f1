//! Tenant instances: route table, lifecycle, and the per-tenant listener
//!
//! An instance is one tenant's service unit. Its route table and templates
//! are fixed at creation; the only mutable runtime pieces are the stats
//! counters and the lifecycle state. The instance serves requests two
//! ways: through its own loopback listener (`run`), and directly through
//! `serve` when the dispatcher routes in-process.

use futures::future::BoxFuture;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, TenantConfig};
use crate::error::{json_error_response, HostErrorCode};
use crate::files;
use crate::stats::{RuntimeStats, StatsSnapshot};
use crate::template::{self, Template};

/// Template name backing the root handler
const INDEX_TEMPLATE: &str = "index";

/// Placeholder favicon body, served verbatim
const FAVICON_BODY: &str = "mycon";

/// Lifecycle state of a tenant instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Built from config, listener not started
    Created,
    /// Run loop entered, listener not yet bound
    Starting,
    /// Listener bound and accepting
    Running,
    /// Stop signalled, draining the accept loop
    Stopping,
    /// Accept loop exited; terminal
    Stopped,
    /// Listener bind failed; terminal
    Failed,
}

/// Response type produced by tenant handlers
pub type HandlerResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// A boxed request handler owned by an instance's route table
pub type HandlerFn =
    Arc<dyn Fn(Request<Incoming>) -> BoxFuture<'static, HandlerResponse> + Send + Sync>;

/// Status row for the admin tenant listing
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub state: InstanceState,
    pub port: u16,
    pub visits: u64,
    pub errors: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// One tenant's service unit
pub struct Instance {
    /// Tenant name; unique routing key
    id: String,
    /// Local port the instance's own listener binds
    port: u16,
    /// URL advertised in rendered pages
    public_url: String,
    /// Exact path to handler; read-only after registration
    routes: HashMap<String, HandlerFn>,
    /// Handler for paths with no exact route
    fallback: Option<HandlerFn>,
    stats: Arc<RuntimeStats>,
    state: Mutex<InstanceState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Instance {
    /// Build an instance from its tenant descriptor
    ///
    /// Registers the built-in handlers (`/`, `/home`, `/runtime`,
    /// `/favicon.ico`) and the static fallback when the tenant has a
    /// static root. Never fails; bad ports and missing directories only
    /// surface when the listener runs.
    pub fn create(cfg: &TenantConfig, server: &ServerConfig, port: u16) -> Self {
        let stats = Arc::new(RuntimeStats::new());
        let public_url = server.public_url(&cfg.name);
        let style_block = template::render_style_block(&cfg.style);
        let templates: Arc<[Template]> = cfg.templates.clone().into();
        let (shutdown_tx, _) = watch::channel(false);

        let mut instance = Self {
            id: cfg.name.clone(),
            port,
            public_url: public_url.clone(),
            routes: HashMap::new(),
            fallback: None,
            stats: Arc::clone(&stats),
            state: Mutex::new(InstanceState::Created),
            shutdown_tx,
        };

        let root = root_handler(
            cfg.name.clone(),
            Arc::clone(&stats),
            templates,
            public_url,
            style_block,
        );
        instance.add_handler("/", Arc::clone(&root));
        instance.add_handler("/home", root);
        instance.add_handler("/runtime", runtime_handler(stats));
        instance.add_handler("/favicon.ico", favicon_handler());
        if let Some(static_root) = &cfg.static_root {
            instance.set_fallback(static_handler(static_root.clone()));
        }

        instance
    }

    /// Register a handler for an exact path; the last registration wins
    ///
    /// Takes `&mut self`, so registration is only possible before the
    /// instance goes behind the registry's `Arc`.
    pub fn add_handler(&mut self, path: impl Into<String>, handler: HandlerFn) {
        self.routes.insert(path.into(), handler);
    }

    /// Replace the fallback handler for paths with no exact route
    pub fn set_fallback(&mut self, handler: HandlerFn) {
        self.fallback = Some(handler);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    pub fn record_visit(&self) {
        self.stats.record_visit();
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.stats.record_error(message);
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> InstanceStatus {
        let snap = self.stats.snapshot();
        InstanceStatus {
            name: self.id.clone(),
            state: self.state(),
            port: self.port,
            visits: snap.visits,
            errors: snap.error_count,
            started_at: snap.started_at,
        }
    }

    /// Serve one request through the route table
    ///
    /// Exact match first, then the static fallback, then 404. Used by the
    /// instance's own listener and by the dispatcher in in-process mode.
    pub async fn serve(&self, req: Request<Incoming>) -> HandlerResponse {
        let path = req.uri().path();
        if let Some(handler) = self.routes.get(path) {
            return handler(req).await;
        }
        if let Some(fallback) = &self.fallback {
            return fallback(req).await;
        }
        json_error_response(
            HostErrorCode::RouteNotFound,
            format!("no route for '{}'", path),
        )
    }

    /// Bind the instance's own listener and serve until stopped
    ///
    /// A bind failure is recorded in the error log and marks the instance
    /// `Failed`; the error is returned but must not take the host down.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        // Subscribe before the state flips to Starting, so a stop() racing
        // with startup is never missed.
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        {
            let mut state = self.state.lock();
            if *state != InstanceState::Created {
                debug!(tenant = %self.id, state = ?*state, "run skipped");
                return Ok(());
            }
            *state = InstanceState::Starting;
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(tenant = %self.id, addr = %addr, error = %e, "Failed to bind instance listener");
                self.stats.record_error(format!("bind {}: {}", addr, e));
                *self.state.lock() = InstanceState::Failed;
                return Err(e.into());
            }
        };

        {
            let mut state = self.state.lock();
            if *state != InstanceState::Starting {
                // stop() won the race while we were binding
                *state = InstanceState::Stopped;
                return Ok(());
            }
            *state = InstanceState::Running;
        }
        info!(tenant = %self.id, addr = %addr, "Tenant instance listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let instance = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = instance.handle_connection(stream).await {
                                    debug!(peer = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(tenant = %self.id, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(tenant = %self.id, "Tenant instance shutting down");
                        break;
                    }
                }
            }
        }

        *self.state.lock() = InstanceState::Stopped;
        Ok(())
    }

    /// Signal the instance to stop; idempotent
    ///
    /// A never-started instance goes straight to `Stopped`. Stopping an
    /// already stopped, stopping, or failed instance is a no-op. In-flight
    /// connections finish on their own tasks.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        match *state {
            InstanceState::Created => {
                debug!(tenant = %self.id, "Stopping never-started instance");
                *state = InstanceState::Stopped;
            }
            InstanceState::Starting | InstanceState::Running => {
                info!(tenant = %self.id, "Stopping instance");
                *state = InstanceState::Stopping;
                let _ = self.shutdown_tx.send(true);
            }
            InstanceState::Stopping | InstanceState::Stopped | InstanceState::Failed => {}
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let instance = Arc::clone(&self);

        let service = service_fn(move |req: Request<Incoming>| {
            let instance = Arc::clone(&instance);
            async move { Ok::<_, hyper::Error>(instance.serve(req).await) }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("state", &self.state())
            .field("routes", &self.routes.len())
            .finish()
    }
}

fn html_response(body: String) -> HandlerResponse {
    Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with static headers")
}

/// Renders the tenant's `index` template and counts the visit
fn root_handler(
    id: String,
    stats: Arc<RuntimeStats>,
    templates: Arc<[Template]>,
    public_url: String,
    style_block: String,
) -> HandlerFn {
    Arc::new(move |_req| {
        let id = id.clone();
        let stats = Arc::clone(&stats);
        let templates = Arc::clone(&templates);
        let public_url = public_url.clone();
        let style_block = style_block.clone();
        Box::pin(async move {
            stats.record_visit();
            match template::find_template(&templates, INDEX_TEMPLATE) {
                Some(body) => html_response(template::render_page(body, &public_url, &style_block)),
                None => {
                    // Intentionally a 200 with nothing in it; the tenant
                    // simply has no landing page configured.
                    warn!(tenant = %id, "no index template, serving empty body");
                    html_response(String::new())
                }
            }
        })
    })
}

/// Small HTML snippet with the visit count and uptime
fn runtime_handler(stats: Arc<RuntimeStats>) -> HandlerFn {
    Arc::new(move |_req| {
        let stats = Arc::clone(&stats);
        Box::pin(async move {
            let snap = stats.snapshot();
            let body = format!(
                "<small>{} visits; running for {:?} <br>",
                snap.visits, snap.uptime
            );
            html_response(body)
        })
    })
}

fn favicon_handler() -> HandlerFn {
    Arc::new(move |_req| {
        Box::pin(async move {
            Response::builder()
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(
                    Full::new(Bytes::from_static(FAVICON_BODY.as_bytes()))
                        .map_err(|e| match e {})
                        .boxed(),
                )
                .expect("valid response with static headers")
        })
    })
}

fn static_handler(root: PathBuf) -> HandlerFn {
    Arc::new(move |req| {
        let root = root.clone();
        Box::pin(async move {
            let path = req.uri().path().to_string();
            files::serve_static(&root, &path).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_server_config() -> ServerConfig {
        ServerConfig {
            domain: "example.com".to_string(),
            port: 8080,
            ..ServerConfig::default()
        }
    }

    fn test_tenant(name: &str) -> TenantConfig {
        toml::from_str(&format!(
            r#"
name = "{}"

[[templates]]
name = "index"
body = "hello {{public_url}}"
"#,
            name
        ))
        .unwrap()
    }

    async fn wait_for_state(instance: &Arc<Instance>, state: InstanceState) {
        for _ in 0..100 {
            if instance.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "instance never reached {:?}, still {:?}",
            state,
            instance.state()
        );
    }

    #[test]
    fn test_create_starts_in_created_state() {
        let instance = Instance::create(&test_tenant("about"), &test_server_config(), 6666);
        assert_eq!(instance.state(), InstanceState::Created);
        assert_eq!(instance.id(), "about");
        assert_eq!(instance.port(), 6666);
        assert_eq!(instance.public_url(), "http://about.example.com:8080");
        assert_eq!(instance.stats_snapshot().visits, 0);
    }

    #[test]
    fn test_stop_never_started_instance_is_safe() {
        let instance = Instance::create(&test_tenant("about"), &test_server_config(), 6666);

        instance.stop();
        assert_eq!(instance.state(), InstanceState::Stopped);

        // Double stop is a no-op, not a deadlock
        instance.stop();
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[test]
    fn test_status_reflects_counters() {
        let instance = Instance::create(&test_tenant("blog"), &test_server_config(), 6700);
        instance.record_visit();
        instance.record_visit();
        instance.record_error("something went sideways");

        let status = instance.status();
        assert_eq!(status.name, "blog");
        assert_eq!(status.state, InstanceState::Created);
        assert_eq!(status.port, 6700);
        assert_eq!(status.visits, 2);
        assert_eq!(status.errors, 1);
    }

    #[tokio::test]
    async fn test_run_and_stop_lifecycle() {
        // Port 0 gives an ephemeral port, so the bind always succeeds
        let instance = Arc::new(Instance::create(
            &test_tenant("about"),
            &test_server_config(),
            0,
        ));

        let handle = tokio::spawn(Arc::clone(&instance).run());
        wait_for_state(&instance, InstanceState::Running).await;

        instance.stop();
        handle.await.unwrap().unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);

        // Stopping again after the loop exited is a no-op
        instance.stop();
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_marks_instance_failed() {
        // Occupy a port, then point the instance at it
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = blocker.local_addr().unwrap().port();

        let instance = Arc::new(Instance::create(
            &test_tenant("doomed"),
            &test_server_config(),
            taken_port,
        ));

        let result = Arc::clone(&instance).run().await;
        assert!(result.is_err());
        assert_eq!(instance.state(), InstanceState::Failed);

        let snap = instance.stats_snapshot();
        assert_eq!(snap.error_count, 1);
        assert!(snap.errors[0].contains("bind"));

        // A failed instance ignores stop()
        instance.stop();
        assert_eq!(instance.state(), InstanceState::Failed);
    }

    #[tokio::test]
    async fn test_run_after_stop_never_serves() {
        let instance = Arc::new(Instance::create(
            &test_tenant("late"),
            &test_server_config(),
            0,
        ));

        instance.stop();
        assert_eq!(instance.state(), InstanceState::Stopped);

        // run() on a stopped instance returns without binding
        Arc::clone(&instance).run().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
    }
}
