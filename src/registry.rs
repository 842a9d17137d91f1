//! Tenant registry and bootstrap
//!
//! The registry maps subdomain labels to live instances. Entries go in
//! during bootstrap and stay for the life of the process; request-time
//! access is read-only.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::BootstrapError;
use crate::instance::{Instance, InstanceStatus};

/// Registered instances keyed by tenant name
pub struct Registry {
    instances: DashMap<String, Arc<Instance>>,
}

impl Registry {
    /// Create an empty registry
    ///
    /// Returns `Arc<Self>` because the registry is shared between the
    /// dispatcher, the admin server, and the shutdown path.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            instances: DashMap::new(),
        })
    }

    /// Register an instance under its tenant name
    ///
    /// The first registration wins; a second instance under the same name
    /// is rejected with `DuplicateTenant` and never goes live.
    pub fn register(&self, instance: Instance) -> Result<Arc<Instance>, BootstrapError> {
        let name = instance.id().to_string();
        match self.instances.entry(name.clone()) {
            Entry::Occupied(_) => Err(BootstrapError::DuplicateTenant { name }),
            Entry::Vacant(slot) => {
                let instance = Arc::new(instance);
                slot.insert(Arc::clone(&instance));
                Ok(instance)
            }
        }
    }

    /// Look up the instance for a subdomain label
    pub fn lookup(&self, subdomain: &str) -> Option<Arc<Instance>> {
        self.instances.get(subdomain).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.instances.contains_key(subdomain)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Status rows for every registered tenant, sorted by name
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self
            .instances
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Signal every registered instance to stop; idempotent
    pub fn stop_all(&self) {
        for entry in self.instances.iter() {
            entry.value().stop();
        }
    }

    /// Build, register and spawn one instance per configured tenant
    ///
    /// Tenants that fail validation, point at a missing static root, or
    /// collide with an already-registered name are skipped with a log
    /// line; the rest of the config still comes up. Ports are positional,
    /// so a skipped tenant leaves its port unused.
    pub fn bootstrap(self: &Arc<Self>, config: &Config) -> Vec<JoinHandle<anyhow::Result<()>>> {
        let mut handles = Vec::new();

        for (position, tenant) in config.tenants.iter().enumerate() {
            let port = config.server.instance_port(position);

            if let Err(reason) = tenant.validate() {
                let err = BootstrapError::InvalidTenant {
                    name: tenant.name.clone(),
                    reason,
                };
                warn!(error = %err, "Skipping tenant");
                continue;
            }

            if let Some(root) = &tenant.static_root {
                if !root.is_dir() {
                    let err = BootstrapError::MissingStaticRoot {
                        name: tenant.name.clone(),
                        path: root.clone(),
                    };
                    warn!(error = %err, "Skipping tenant");
                    continue;
                }
            }

            let instance = match self.register(Instance::create(tenant, &config.server, port)) {
                Ok(instance) => instance,
                Err(err) => {
                    warn!(error = %err, "Skipping tenant");
                    continue;
                }
            };

            info!(tenant = %instance.id(), port, "Registered tenant");
            handles.push(tokio::spawn(instance.run()));
        }

        handles
    }
}
