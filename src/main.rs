use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenement::admin::{AdminServer, PKG_NAME, VERSION};
use tenement::config::Config;
use tenement::dispatcher::Dispatcher;
use tenement::registry::Registry;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenement=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tenement.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // Print startup banner
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Register every configured tenant and start its instance
    let registry = Registry::new();
    let instance_handles = registry.bootstrap(&config);

    if registry.is_empty() {
        warn!("No tenants came up; every request will answer 404");
    }

    // Create the public dispatcher
    let public_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid public bind address");
            anyhow::anyhow!("Invalid public bind address: {}", e)
        })?;

    let dispatcher = Dispatcher::new(
        public_addr,
        &config.server,
        registry.clone(),
        shutdown_rx.clone(),
    );

    let mut dispatcher_handle = tokio::spawn(async move {
        if let Err(e) = dispatcher.run().await {
            error!(error = %e, "Dispatcher error");
        }
    });

    // Create admin server (always on loopback for internal use)
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        registry.clone(),
        shutdown_rx.clone(),
        admin_token,
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for a shutdown signal. The dispatcher handle sits in the same
    // select; before shutdown is signalled it only completes on failure.
    let mut dispatcher_failed = false;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = &mut dispatcher_handle => {
                error!("Dispatcher terminated unexpectedly, shutting down");
                dispatcher_failed = true;
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.expect("Failed to listen for Ctrl+C");
                info!("Received Ctrl+C, shutting down...");
            }
            _ = &mut dispatcher_handle => {
                error!("Dispatcher terminated unexpectedly, shutting down");
                dispatcher_failed = true;
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all tenant instances
    info!("Stopping all tenants...");
    registry.stop_all();

    // Wait for servers to stop (with timeout). The dispatcher handle must
    // not be polled again once it already completed in the select above.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in instance_handles {
            let _ = handle.await;
        }
        if !dispatcher_failed {
            let _ = dispatcher_handle.await;
        }
        let _ = admin_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    if dispatcher_failed {
        anyhow::bail!("Dispatcher terminated unexpectedly");
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting multi-tenant host");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        domain = %config.server.domain,
        mode = ?config.server.mode,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        instance_base_port = config.server.instance_base_port,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Dispatch settings"
    );
    info!(
        tenant_count = config.tenants.len(),
        tenants = ?config
            .tenants
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>(),
        "Configured tenants"
    );
}
