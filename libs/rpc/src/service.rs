//! Service Registry
//!
//! Maps service names to handlers. Mutations serialize on a mutex and then
//! publish a fresh immutable snapshot through [`ArcSwap`], so the dispatch
//! path on reactor threads never waits on a registering thread.

use crate::call::InboundCall;
use crate::{Result, RpcError};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Consumer of inbound calls for one service name.
///
/// Implementations must eventually respond to every call they accept.
/// Dropping an [`InboundCall`] unanswered fails it with `ErrorCode::Unknown`.
pub trait RpcService: Send + Sync + 'static {
    /// Process one call; invoked on a reactor thread, so long work belongs elsewhere
    fn handle(&self, call: InboundCall);

    /// Entry point used by the messenger; services with their own queue override this
    fn queue_inbound_call(&self, call: InboundCall) {
        self.handle(call);
    }

    /// Invoked once when the service is unregistered or the messenger shuts down
    fn shutdown(&self) {}
}

/// Published view of the registry
pub type ServiceSnapshot = HashMap<String, Arc<dyn RpcService>>;

#[derive(Default)]
struct Entries {
    services: ServiceSnapshot,
    /// Set once by [`ServiceRegistry::close`]; registration fails afterwards
    closed: bool,
}

/// Name to handler map with lock-free lookup
pub struct ServiceRegistry {
    owner: String,
    entries: Mutex<Entries>,
    snapshot: ArcSwap<ServiceSnapshot>,
}

impl ServiceRegistry {
    /// Create an empty registry; `owner` names the messenger in error messages
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            entries: Mutex::new(Entries::default()),
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, service: Arc<dyn RpcService>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.closed {
            return Err(RpcError::illegal_state(format!(
                "Messenger {} is shutting down",
                self.owner
            )));
        }
        let services = &mut entries.services;
        if services.contains_key(name) {
            return Err(RpcError::already_present(format!(
                "Service {} is already present",
                name
            )));
        }
        services.insert(name.to_string(), service);
        self.snapshot.store(Arc::new(services.clone()));

        info!(messenger = %self.owner, service = name, "Service registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let removed = {
            let mut entries = self.entries.lock();
            let services = &mut entries.services;
            let removed = services.remove(name).ok_or_else(|| {
                RpcError::service_unavailable(format!(
                    "service {} not registered on {}",
                    name, self.owner
                ))
            })?;
            self.snapshot.store(Arc::new(services.clone()));
            removed
        };

        removed.shutdown();
        info!(messenger = %self.owner, service = name, "Service unregistered");
        Ok(())
    }

    /// Remove every service, returning how many were registered
    pub fn unregister_all(&self) -> usize {
        self.clear(false)
    }

    /// Remove every service and refuse any later registration
    pub fn close(&self) -> usize {
        self.clear(true)
    }

    pub fn is_closed(&self) -> bool {
        self.entries.lock().closed
    }

    fn clear(&self, close: bool) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            entries.closed |= close;
            let removed = std::mem::take(&mut entries.services);
            self.snapshot.store(Arc::new(HashMap::new()));
            removed
        };

        for service in removed.values() {
            service.shutdown();
        }
        if !removed.is_empty() {
            debug!(messenger = %self.owner, count = removed.len(), "All services unregistered");
        }
        removed.len()
    }

    /// Hot-path lookup against the current snapshot
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn RpcService>> {
        self.snapshot.load().get(name).cloned()
    }

    /// Current snapshot; never changes after it is returned
    pub fn snapshot(&self) -> Arc<ServiceSnapshot> {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.load();
        let mut names: Vec<_> = snapshot.keys().collect();
        names.sort();
        f.debug_struct("ServiceRegistry")
            .field("owner", &self.owner)
            .field("services", &names)
            .finish()
    }
}
