use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::template::{Style, Template};

/// Global configuration for the host
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Tenant descriptors, in registration order
    ///
    /// Order matters: each tenant's local port is derived from its
    /// position in this list.
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

/// How the dispatcher hands a request to a tenant instance
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Serve through the instance's route table inside the dispatcher task
    #[default]
    InProcess,
    /// Forward over loopback to the instance's own listener
    Loopback,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the public listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public port all tenant URLs are built against (default: 8080)
    #[serde(default = "default_public_port")]
    pub port: u16,

    /// Parent domain; the routing key is the label in front of it
    #[serde(default = "default_domain")]
    pub domain: String,

    /// First local port handed to a tenant instance (default: 6666)
    ///
    /// Instance N in the tenants list gets instance_base_port + N. A
    /// skipped tenant leaves its port unused.
    #[serde(default = "default_instance_base_port")]
    pub instance_base_port: u16,

    /// Dispatch mode: "in_process" (default) or "loopback"
    #[serde(default)]
    pub mode: DispatchMode,

    /// Port for the internal admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin tenant listing
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle loopback connections per tenant (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle loopback connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max seconds to wait for a loopback round trip (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Local port for the tenant at `position` in the config order
    pub fn instance_port(&self, position: usize) -> u16 {
        self.instance_base_port + position as u16
    }

    /// Public URL a tenant advertises in its rendered pages
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("http://{}.{}:{}", subdomain, self.domain, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_public_port(),
            domain: default_domain(),
            instance_base_port: default_instance_base_port(),
            mode: DispatchMode::default(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
        }
    }
}

/// Configuration for a single tenant
#[derive(Debug, Deserialize, Clone)]
pub struct TenantConfig {
    /// Subdomain label the tenant is reachable under; unique routing key
    pub name: String,

    /// Palette for the rendered style block
    #[serde(default)]
    pub style: Style,

    /// Named page templates; `index` backs the root handler
    #[serde(default)]
    pub templates: Vec<Template>,

    /// Directory served for paths with no exact route
    pub static_root: Option<PathBuf>,
}

impl TenantConfig {
    /// Validate the tenant descriptor
    ///
    /// The name has to work as a single DNS label in front of the parent
    /// domain, so dots and whitespace are rejected outright. Request
    /// hosts are lowercased before routing, so an uppercase name would
    /// register fine and then never match a lookup.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("'name' must not be empty".to_string());
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(format!(
                "'name' must be a lowercase DNS label (got '{}')",
                self.name
            ));
        }

        if self.name.starts_with('-') || self.name.ends_with('-') {
            return Err(format!(
                "'name' must not start or end with '-' (got '{}')",
                self.name
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_public_port() -> u16 {
    8080
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_instance_base_port() -> u16 {
    6666
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per tenant
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for a tenant to respond over loopback
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate server-level configuration
    ///
    /// Per-tenant problems are not fatal here; bootstrap skips and logs
    /// them tenant by tenant. This rejects only configs the host cannot
    /// start under at all.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.domain.is_empty() {
            errors.push("'server.domain' must not be empty".to_string());
        }

        if self.server.port == 0 {
            errors.push("'server.port' must be greater than 0".to_string());
        }

        if self.server.instance_base_port == 0 {
            errors.push("'server.instance_base_port' must be greater than 0".to_string());
        }

        if usize::from(self.server.instance_base_port) + self.tenants.len() > usize::from(u16::MAX)
        {
            errors.push(format!(
                "'server.instance_base_port' {} leaves no room for {} tenants",
                self.server.instance_base_port,
                self.tenants.len()
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
