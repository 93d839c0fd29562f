//! Scoped, exclusive access to named instrument resources.
//!
//! [`ResourceManager::acquire`] opens the transport of a configured resource and
//! returns a [`ResourceGuard`]. While the guard lives, no other owner can acquire
//! the same name; a second `acquire` fails instead of interleaving commands.
//! Dropping the guard closes the transport and releases the name on every exit
//! path (return, `?`, abort, or a cancelled future).

use crate::adapters::Adapter;
use crate::config::ResourceConfig;
use crate::error::{DaqError, DaqResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Opens the transport of a configured resource.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, config: &ResourceConfig) -> DaqResult<Box<dyn Adapter>>;
}

/// Registry of configured resources with ownership tracking.
///
/// Cloning is cheap; clones share ownership state.
#[derive(Clone)]
pub struct ResourceManager {
    resources: Arc<BTreeMap<String, ResourceConfig>>,
    connector: Arc<dyn Connector>,
    owned: Arc<Mutex<HashSet<String>>>,
}

impl ResourceManager {
    /// Manager over the configured resources, opened through `connector`.
    pub fn new(resources: BTreeMap<String, ResourceConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            resources: Arc::new(resources),
            connector,
            owned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open `name` for exclusive use.
    ///
    /// # Errors
    /// - `Configuration` if no resource of that name is configured
    /// - `Connection` if the resource is already held or cannot be opened
    pub async fn acquire(&self, name: &str) -> DaqResult<ResourceGuard> {
        let config = self.resources.get(name).ok_or_else(|| {
            DaqError::Configuration(format!("No resource named '{}' is configured", name))
        })?;

        // Claimed before connecting so a concurrent acquire cannot race us.
        let claim = Claim::take(&self.owned, name)?;
        let adapter = self.connector.connect(name, config).await?;
        debug!(resource = name, address = %config.address, "resource acquired");

        Ok(ResourceGuard {
            name: name.to_string(),
            adapter: tokio::sync::Mutex::new(adapter),
            _claim: claim,
        })
    }

    /// True if `name` is configured and not currently held.
    pub fn is_available(&self, name: &str) -> bool {
        self.resources.contains_key(name) && !self.owned.lock().contains(name)
    }

    /// True if a resource of that name is configured.
    pub fn is_configured(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }
}

/// Ownership marker, released on drop.
struct Claim {
    owned: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Claim {
    fn take(owned: &Arc<Mutex<HashSet<String>>>, name: &str) -> DaqResult<Self> {
        if !owned.lock().insert(name.to_string()) {
            return Err(DaqError::connection(name, "resource is already in use"));
        }
        Ok(Self {
            owned: owned.clone(),
            name: name.to_string(),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.owned.lock().remove(&self.name);
        debug!(resource = %self.name, "resource released");
    }
}

/// Exclusive handle to an open resource.
///
/// Commands issued through one guard never interleave; the transport is held
/// for the whole of each `write` or `query`.
pub struct ResourceGuard {
    name: String,
    adapter: tokio::sync::Mutex<Box<dyn Adapter>>,
    _claim: Claim,
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ResourceGuard {
    /// Wrap an already open adapter. The guard is not tracked by any manager.
    pub fn detached(name: &str, adapter: Box<dyn Adapter>) -> Self {
        Self {
            name: name.to_string(),
            adapter: tokio::sync::Mutex::new(adapter),
            _claim: Claim {
                owned: Arc::new(Mutex::new(HashSet::new())),
                name: name.to_string(),
            },
        }
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a command without reply.
    pub async fn write(&self, command: &str) -> DaqResult<()> {
        self.adapter.lock().await.write(command).await
    }

    /// Send a command and read the reply.
    pub async fn query(&self, command: &str) -> DaqResult<String> {
        self.adapter.lock().await.query(command).await
    }
}
