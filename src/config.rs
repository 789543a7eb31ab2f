//! Configuration store.
//!
//! [`ConfigStore`] owns the active [`PollerConfiguration`], the monitor
//! registry resolved from it and the derived address caches. A single
//! reader/writer lock guards all three, so readers never see a half-built
//! cache: queries take the read lock, mutations take the write lock.
//!
//! The configuration document is JSON. [`ConfigSource`] is the persistence
//! seam; [`FileConfigSource`] keeps the document in a file.

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, PollResult};
use crate::model::{DistributionContext, Monitor, Package, PollerConfiguration, Service};
use crate::package::{build_candidate_cache, build_url_cache, AddressCaches, PackageMatcher};
use crate::range::compare_addresses;
use crate::registry::{MonitorCatalog, ServiceMonitor, ServiceMonitorLocator, ServiceMonitorRegistry};
use crate::storage::{FilterService, IncludeUrlResolver};

/// Where the configuration document lives.
pub trait ConfigSource: Send + Sync {
    /// Read and parse the current document.
    fn load(&self) -> Result<PollerConfiguration, ConfigError>;

    /// Replace the stored document with `serialized`.
    fn persist(&self, serialized: &str) -> Result<(), ConfigError>;

    /// Human-readable location, for logs and errors.
    fn location(&self) -> String;
}

/// JSON configuration file.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Source backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "poller-configuration".into(), |n| n.to_string_lossy().into_owned());
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<PollerConfiguration, ConfigError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| ConfigError::Load {
            location: self.location(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            message: format!("{}: {e}", self.location()),
        })
    }

    fn persist(&self, serialized: &str) -> Result<(), ConfigError> {
        // Write aside, then rename over the active file.
        let tmp = self.temp_path();
        let persist_err = |e: std::io::Error| ConfigError::Persist {
            location: self.location(),
            message: e.to_string(),
        };
        fs::write(&tmp, serialized).map_err(persist_err)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(persist_err(e));
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Configuration document held in memory.
#[derive(Debug, Default)]
pub struct InMemoryConfigSource {
    document: Mutex<String>,
    fail_persist: AtomicBool,
    persisted: AtomicUsize,
}

impl InMemoryConfigSource {
    /// Source holding `config`.
    pub fn new(config: &PollerConfiguration) -> Result<Self, ConfigError> {
        let source = Self::default();
        source.set(config)?;
        Ok(source)
    }

    /// Replace the held document with `config`.
    pub fn set(&self, config: &PollerConfiguration) -> Result<(), ConfigError> {
        let doc = serialize(config)?;
        self.set_document(doc);
        Ok(())
    }

    /// Replace the held document with raw text.
    pub fn set_document(&self, document: impl Into<String>) {
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = document.into();
    }

    /// The held document.
    #[must_use]
    pub fn document(&self) -> String {
        self.document.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make every subsequent persist fail.
    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Number of successful persists.
    #[must_use]
    pub fn persist_count(&self) -> usize {
        self.persisted.load(Ordering::SeqCst)
    }
}

impl ConfigSource for InMemoryConfigSource {
    fn load(&self) -> Result<PollerConfiguration, ConfigError> {
        let doc = self.document();
        serde_json::from_str(&doc).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    fn persist(&self, serialized: &str) -> Result<(), ConfigError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(ConfigError::Persist {
                location: self.location(),
                message: "persistence disabled".to_string(),
            });
        }
        self.set_document(serialized);
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

fn serialize(config: &PollerConfiguration) -> Result<String, ConfigError> {
    serde_json::to_string_pretty(config).map_err(|e| ConfigError::Serialize {
        message: e.to_string(),
    })
}

/// Rejects documents that cannot be installed.
pub fn validate(config: &PollerConfiguration) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for pkg in &config.packages {
        if pkg.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "package with empty name".to_string(),
            });
        }
        if !names.insert(pkg.name.as_str()) {
            return Err(ConfigError::Invalid {
                message: format!("duplicate package '{}'", pkg.name),
            });
        }
    }
    if let Some(m) = config.monitors.iter().find(|m| m.service.trim().is_empty()) {
        return Err(ConfigError::Invalid {
            message: format!("monitor '{}' declares no service", m.implementation),
        });
    }
    Ok(())
}

/// Immutable per-instance settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStoreOptions {
    /// Name of the server this instance runs on.
    pub local_server: String,
    /// Restrict package filters to nodes owned by `local_server`.
    pub verify_server: bool,
    /// Role of this instance, used to pick monitor locators.
    pub distribution_context: DistributionContext,
}

impl Default for ConfigStoreOptions {
    fn default() -> Self {
        Self {
            local_server: "localhost".to_string(),
            verify_server: false,
            distribution_context: DistributionContext::Daemon,
        }
    }
}

impl ConfigStoreOptions {
    fn server_restriction(&self) -> Option<&str> {
        self.verify_server.then_some(self.local_server.as_str())
    }
}

#[derive(Debug, Default)]
struct ConfigState {
    config: PollerConfiguration,
    registry: ServiceMonitorRegistry,
    caches: AddressCaches,
}

impl ConfigState {
    fn matcher(&self) -> PackageMatcher<'_> {
        PackageMatcher::new(&self.config.packages, &self.caches)
    }

    fn package(&self, name: &str) -> Option<&Package> {
        self.config.packages.iter().find(|p| p.name == name)
    }

    fn is_polled(&self, ip: &IpAddr, service: &str, local_only: bool) -> bool {
        if !self.registry.is_monitored(service) {
            return false;
        }
        let matcher = self.matcher();
        self.config.packages.iter().any(|p| {
            !(local_only && p.remote) && p.is_service_enabled(service) && matcher.is_in_package(ip, p)
        })
    }
}

/// Shared/exclusive owner of the active configuration.
pub struct ConfigStore {
    source: Arc<dyn ConfigSource>,
    catalog: MonitorCatalog,
    filter: Arc<dyn FilterService>,
    urls: Arc<dyn IncludeUrlResolver>,
    options: ConfigStoreOptions,
    state: RwLock<ConfigState>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("source", &self.source.location())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Load the document from `source` and build the derived state.
    pub fn load(
        source: Arc<dyn ConfigSource>,
        catalog: MonitorCatalog,
        filter: Arc<dyn FilterService>,
        urls: Arc<dyn IncludeUrlResolver>,
        options: ConfigStoreOptions,
    ) -> PollResult<Self> {
        let store = Self {
            source,
            catalog,
            filter,
            urls,
            options,
            state: RwLock::new(ConfigState::default()),
        };
        let initial = store.build_state()?;
        *store.write() = initial;
        Ok(store)
    }

    // State is only ever replaced whole or appended to, so a guard recovered
    // from a poisoned lock still holds a consistent configuration.
    fn read(&self) -> RwLockReadGuard<'_, ConfigState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConfigState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_state(&self) -> PollResult<ConfigState> {
        let config = self.source.load()?;
        validate(&config)?;
        Ok(self.derive_state(config))
    }

    fn derive_state(&self, config: PollerConfiguration) -> ConfigState {
        let registry = ServiceMonitorRegistry::initialize(&config.monitors, &self.catalog);
        let mut caches = AddressCaches::new();
        caches.replace_urls(build_url_cache(&config.packages, self.urls.as_ref()));
        caches.replace_candidates(build_candidate_cache(
            &config.packages,
            self.filter.as_ref(),
            self.options.server_restriction(),
        ));
        debug!(
            packages = config.packages.len(),
            monitors = registry.len(),
            cached = caches.package_count(),
            "configuration state built"
        );
        ConfigState {
            config,
            registry,
            caches,
        }
    }

    /// Instance settings.
    #[must_use]
    pub fn options(&self) -> &ConfigStoreOptions {
        &self.options
    }

    /// Where the document is read from.
    #[must_use]
    pub fn location(&self) -> String {
        self.source.location()
    }

    // ----- mutations -----

    /// Re-read the document and replace all state.
    ///
    /// On failure the active configuration stays in force.
    pub fn reload(&self) -> PollResult<()> {
        // Held across the build so concurrent reloads install in call order.
        let mut state = self.write();
        let next = match self.build_state() {
            Ok(next) => next,
            Err(e) => {
                warn!(location = %self.source.location(), error = %e, "configuration reload failed; keeping active configuration");
                return Err(e);
            }
        };
        *state = next;
        info!(location = %self.source.location(), "configuration reloaded");
        Ok(())
    }

    /// Persist the in-memory document, then reload it.
    ///
    /// Nothing in memory changes unless persistence succeeds.
    pub fn save(&self) -> PollResult<()> {
        let mut state = self.write();
        let serialized = serialize(&state.config)?;
        self.source.persist(&serialized)?;
        *state = self.build_state()?;
        info!(location = %self.source.location(), "configuration saved");
        Ok(())
    }

    /// Append a package. Caches are not rebuilt.
    pub fn add_package(&self, pkg: Package) -> PollResult<()> {
        let mut state = self.write();
        if state.package(&pkg.name).is_some() {
            return Err(ConfigError::Invalid {
                message: format!("duplicate package '{}'", pkg.name),
            }
            .into());
        }
        state.config.packages.push(pkg);
        Ok(())
    }

    /// Append a monitor declaration. It is resolved on the next reload.
    pub fn add_monitor(&self, service: &str, implementation: &str) -> PollResult<()> {
        let mut state = self.write();
        state.config.monitors.push(Monitor::new(service, implementation));
        Ok(())
    }

    /// Re-evaluate every package filter and include URL.
    pub fn rebuild_candidate_cache(&self) -> PollResult<()> {
        let mut state = self.write();
        let urls = build_url_cache(&state.config.packages, self.urls.as_ref());
        let candidates = build_candidate_cache(
            &state.config.packages,
            self.filter.as_ref(),
            self.options.server_restriction(),
        );
        state.caches.replace_urls(urls);
        state.caches.replace_candidates(candidates);
        debug!(cached = state.caches.package_count(), "candidate cache rebuilt");
        Ok(())
    }

    // ----- queries -----

    /// Copy of the active document.
    #[must_use]
    pub fn configuration(&self) -> PollerConfiguration {
        self.read().config.clone()
    }

    /// Package by name.
    #[must_use]
    pub fn package(&self, name: &str) -> Option<Package> {
        self.read().package(name).cloned()
    }

    /// Packages in declaration order.
    #[must_use]
    pub fn packages(&self) -> Vec<Package> {
        self.read().config.packages.clone()
    }

    /// Monitor declarations in declaration order.
    #[must_use]
    pub fn monitors(&self) -> Vec<Monitor> {
        self.read().config.monitors.clone()
    }

    /// Returns true if the address belongs to any package.
    #[must_use]
    pub fn is_polled(&self, ip: &IpAddr) -> bool {
        self.read().matcher().first_match(ip).is_some()
    }

    /// Returns true if the address belongs to any non-remote package.
    #[must_use]
    pub fn is_polled_locally(&self, ip: &IpAddr) -> bool {
        self.read().matcher().first_local_match(ip).is_some()
    }

    /// Returns true if the service has a monitor and some package containing the
    /// address enables it.
    #[must_use]
    pub fn is_service_polled(&self, ip: &IpAddr, service: &str) -> bool {
        self.read().is_polled(ip, service, false)
    }

    /// [`ConfigStore::is_service_polled`] restricted to non-remote packages.
    #[must_use]
    pub fn is_service_polled_locally(&self, ip: &IpAddr, service: &str) -> bool {
        self.read().is_polled(ip, service, true)
    }

    /// Returns true if the named package enables the service and it has a monitor.
    #[must_use]
    pub fn is_polled_in_package(&self, service: &str, package: &str) -> bool {
        let state = self.read();
        state
            .package(package)
            .is_some_and(|p| p.is_service_enabled(service))
            && state.registry.is_monitored(service)
    }

    /// Returns true if the address belongs to the named package.
    #[must_use]
    pub fn is_in_package(&self, ip: &IpAddr, package: &str) -> bool {
        let state = self.read();
        state
            .package(package)
            .is_some_and(|p| state.matcher().is_in_package(ip, p))
    }

    /// First package containing the address.
    #[must_use]
    pub fn first_package_match(&self, ip: &IpAddr) -> Option<Package> {
        self.read().matcher().first_match(ip).cloned()
    }

    /// First non-remote package containing the address.
    #[must_use]
    pub fn first_local_package_match(&self, ip: &IpAddr) -> Option<Package> {
        self.read().matcher().first_local_match(ip).cloned()
    }

    /// Names of every package containing the address.
    #[must_use]
    pub fn all_package_matches(&self, ip: &IpAddr) -> Vec<String> {
        let state = self.read();
        state
            .matcher()
            .all_matches(ip)
            .into_iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Names of every non-remote package containing the address.
    #[must_use]
    pub fn all_local_package_matches(&self, ip: &IpAddr) -> Vec<String> {
        let state = self.read();
        state
            .matcher()
            .all_local_matches(ip)
            .into_iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// First non-remote package that contains the address, enables the service,
    /// and for which the service has a monitor.
    #[must_use]
    pub fn first_local_package_for_service(&self, ip: &IpAddr, service: &str) -> Option<Package> {
        let state = self.read();
        if !state.registry.is_monitored(service) {
            return None;
        }
        let matcher = state.matcher();
        state
            .config
            .packages
            .iter()
            .find(|p| !p.remote && p.is_service_enabled(service) && matcher.is_in_package(ip, p))
            .cloned()
    }

    /// Service declared by the named package.
    #[must_use]
    pub fn service_in_package(&self, service: &str, package: &str) -> Option<Service> {
        self.read()
            .package(package)
            .and_then(|p| p.service(service))
            .cloned()
    }

    /// Returns true if the named package enables the service.
    #[must_use]
    pub fn is_service_in_package_and_enabled(&self, service: &str, package: &str) -> bool {
        self.read()
            .package(package)
            .is_some_and(|p| p.is_service_enabled(service))
    }

    /// Value of a monitor parameter for a service in a package.
    #[must_use]
    pub fn service_parameter(&self, package: &str, service: &str, key: &str) -> Option<String> {
        self.read()
            .package(package)
            .and_then(|p| p.service(service))
            .and_then(|s| s.parameter(key))
            .map(str::to_string)
    }

    /// Archive step of a package, in seconds.
    #[must_use]
    pub fn step(&self, package: &str) -> Option<u32> {
        self.read().package(package).map(|p| p.rrd.step)
    }

    /// Archive definitions of a package.
    #[must_use]
    pub fn rra_list(&self, package: &str) -> Option<Vec<String>> {
        self.read().package(package).map(|p| p.rrd.rra.clone())
    }

    /// Candidate addresses of a package, in address order.
    #[must_use]
    pub fn candidate_addresses(&self, package: &str) -> Vec<IpAddr> {
        let state = self.read();
        let mut out: Vec<IpAddr> = state
            .caches
            .candidates(package)
            .map(|ips| ips.iter().copied().collect())
            .unwrap_or_default();
        out.sort_by(compare_addresses);
        out
    }

    /// Poller thread count.
    #[must_use]
    pub fn threads(&self) -> u32 {
        self.read().config.threads
    }

    /// Returns true if node-outage processing is on.
    #[must_use]
    pub fn is_node_outage_processing_enabled(&self) -> bool {
        self.read().config.node_outage.status.eq_ignore_ascii_case("on")
    }

    /// Service whose loss marks a node down.
    #[must_use]
    pub fn critical_service(&self) -> Option<String> {
        self.read().config.node_outage.critical_service.clone()
    }

    /// Poll every service of a down node when no critical service is set.
    #[must_use]
    pub fn should_poll_all_if_no_critical_service_defined(&self) -> bool {
        self.read()
            .config
            .node_outage
            .poll_all_if_no_critical_service_defined
    }

    /// Returns true if path outages are tracked.
    #[must_use]
    pub fn is_path_outage_enabled(&self) -> bool {
        self.read().config.path_outage_enabled
    }

    /// Returns true if slow services are reported unresponsive rather than down.
    #[must_use]
    pub fn is_service_unresponsive_enabled(&self) -> bool {
        self.read().config.service_unresponsive_enabled
    }

    /// Returns true if the service has a resolved monitor.
    #[must_use]
    pub fn is_service_monitored(&self, service: &str) -> bool {
        self.read().registry.is_monitored(service)
    }

    /// Monitor for a service.
    #[must_use]
    pub fn service_monitor(&self, service: &str) -> Option<Arc<dyn ServiceMonitor>> {
        self.read().registry.monitor(service)
    }

    /// Locators usable in `context`.
    #[must_use]
    pub fn service_monitor_locators(&self, context: DistributionContext) -> Vec<ServiceMonitorLocator> {
        self.read().registry.locators_for(context)
    }

    /// Locators usable in this instance's own distribution context.
    #[must_use]
    pub fn local_monitor_locators(&self) -> Vec<ServiceMonitorLocator> {
        self.service_monitor_locators(self.options.distribution_context)
    }

    /// Release every resolved monitor.
    pub fn release_all_service_monitors(&self) {
        self.read().registry.release_all();
    }
}
