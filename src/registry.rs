//! Service monitor registry.
//!
//! Monitor implementations are registered explicitly in a [`MonitorCatalog`]
//! at startup, together with the distribution contexts they support. The
//! registry resolves the configured monitor declarations against the catalog
//! once per configuration load.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ExecutionError, PollResult};
use crate::model::{DistributionContext, Monitor};

/// A monitor implementation able to poll one kind of service.
pub trait ServiceMonitor: Send + Sync + fmt::Debug {
    /// Implementation identifier this monitor was registered under.
    fn implementation(&self) -> &str;

    /// Release resources held by the monitor.
    fn release(&self) {}
}

/// Monitor with no poller-side state; polling itself happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredMonitor {
    implementation: String,
}

impl DeclaredMonitor {
    /// Monitor for `implementation`.
    #[must_use]
    pub fn new(implementation: impl Into<String>) -> Self {
        Self {
            implementation: implementation.into(),
        }
    }
}

impl ServiceMonitor for DeclaredMonitor {
    fn implementation(&self) -> &str {
        &self.implementation
    }
}

/// Builds a monitor instance.
pub type MonitorFactory = Arc<dyn Fn() -> PollResult<Arc<dyn ServiceMonitor>> + Send + Sync>;

#[derive(Clone)]
struct CatalogEntry {
    contexts: Vec<DistributionContext>,
    factory: MonitorFactory,
}

/// Startup-time registration table: implementation id to factory and supported contexts.
#[derive(Clone, Default)]
pub struct MonitorCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl fmt::Debug for MonitorCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.entries.keys().collect();
        ids.sort();
        f.debug_struct("MonitorCatalog").field("implementations", &ids).finish()
    }
}

impl MonitorCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. No declared contexts means daemon only.
    pub fn register(
        &mut self,
        implementation: impl Into<String>,
        contexts: &[DistributionContext],
        factory: MonitorFactory,
    ) -> &mut Self {
        let contexts = if contexts.is_empty() {
            vec![DistributionContext::Daemon]
        } else {
            contexts.to_vec()
        };
        self.entries
            .insert(implementation.into(), CatalogEntry { contexts, factory });
        self
    }

    /// Register a [`DeclaredMonitor`] for `implementation`.
    pub fn declare(&mut self, implementation: impl Into<String>, contexts: &[DistributionContext]) -> &mut Self {
        let implementation = implementation.into();
        let id = implementation.clone();
        let factory: MonitorFactory = Arc::new(move || -> PollResult<Arc<dyn ServiceMonitor>> {
            Ok(Arc::new(DeclaredMonitor::new(id.clone())))
        });
        self.register(implementation, contexts, factory)
    }

    /// Returns true if the implementation is registered.
    #[must_use]
    pub fn contains(&self, implementation: &str) -> bool {
        self.entries.contains_key(implementation)
    }

    fn instantiate(&self, implementation: &str) -> PollResult<(Arc<dyn ServiceMonitor>, Vec<DistributionContext>)> {
        let entry = self
            .entries
            .get(implementation)
            .ok_or_else(|| ExecutionError::MonitorUnavailable {
                implementation: implementation.to_string(),
                reason: "not registered".to_string(),
            })?;
        let monitor = (entry.factory)()?;
        Ok((monitor, entry.contexts.clone()))
    }
}

/// Resolved monitor bound to a service name.
#[derive(Debug, Clone)]
pub struct ServiceMonitorLocator {
    service: String,
    implementation: String,
    contexts: Vec<DistributionContext>,
    monitor: Arc<dyn ServiceMonitor>,
}

impl ServiceMonitorLocator {
    /// Service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Implementation id.
    #[must_use]
    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    /// Declared contexts.
    #[must_use]
    pub fn contexts(&self) -> &[DistributionContext] {
        &self.contexts
    }

    /// Returns true if the monitor may run in `context`.
    #[must_use]
    pub fn supports(&self, context: DistributionContext) -> bool {
        self.contexts
            .iter()
            .any(|c| *c == context || *c == DistributionContext::All)
    }

    /// The monitor instance.
    #[must_use]
    pub fn monitor(&self) -> Arc<dyn ServiceMonitor> {
        Arc::clone(&self.monitor)
    }
}

/// Service name to resolved monitor.
#[derive(Debug, Clone, Default)]
pub struct ServiceMonitorRegistry {
    locators: Vec<ServiceMonitorLocator>,
    index: HashMap<String, usize>,
}

impl ServiceMonitorRegistry {
    /// Resolve every declaration. Unresolvable monitors are logged and left out.
    #[must_use]
    pub fn initialize(monitors: &[Monitor], catalog: &MonitorCatalog) -> Self {
        let mut registry = Self::default();
        for decl in monitors {
            match catalog.instantiate(&decl.implementation) {
                Ok((monitor, contexts)) => {
                    debug!(service = %decl.service, implementation = %decl.implementation, "resolved service monitor");
                    registry.insert(ServiceMonitorLocator {
                        service: decl.service.clone(),
                        implementation: decl.implementation.clone(),
                        contexts,
                        monitor,
                    });
                }
                Err(e) => {
                    warn!(
                        service = %decl.service,
                        implementation = %decl.implementation,
                        error = %e,
                        "failed to load monitor; service will not be polled"
                    );
                }
            }
        }
        registry
    }

    // A later declaration for the same service replaces the earlier one.
    fn insert(&mut self, locator: ServiceMonitorLocator) {
        match self.index.get(&locator.service) {
            Some(&idx) => self.locators[idx] = locator,
            None => {
                self.index.insert(locator.service.clone(), self.locators.len());
                self.locators.push(locator);
            }
        }
    }

    /// Returns true if the service has a usable monitor.
    #[must_use]
    pub fn is_monitored(&self, service: &str) -> bool {
        self.index.contains_key(service)
    }

    /// Locator for a service.
    #[must_use]
    pub fn locator(&self, service: &str) -> Option<&ServiceMonitorLocator> {
        self.index.get(service).map(|&idx| &self.locators[idx])
    }

    /// Monitor instance for a service.
    #[must_use]
    pub fn monitor(&self, service: &str) -> Option<Arc<dyn ServiceMonitor>> {
        self.locator(service).map(ServiceMonitorLocator::monitor)
    }

    /// Locators usable in `context`, in declaration order.
    #[must_use]
    pub fn locators_for(&self, context: DistributionContext) -> Vec<ServiceMonitorLocator> {
        self.locators
            .iter()
            .filter(|l| l.supports(context))
            .cloned()
            .collect()
    }

    /// Monitored service names, in declaration order.
    #[must_use]
    pub fn service_names(&self) -> Vec<&str> {
        self.locators.iter().map(|l| l.service.as_str()).collect()
    }

    /// Number of monitored services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locators.len()
    }

    /// Returns true if nothing is monitored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }

    /// Release every monitor.
    pub fn release_all(&self) {
        for locator in &self.locators {
            locator.monitor.release();
        }
    }
}
