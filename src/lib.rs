//! # pollsync - Poll-schedule reconciliation for network monitoring
//!
//! pollsync decides which (interface, service) pairs of a changing device
//! inventory must be actively polled, and keeps that decision consistent with
//! the polling configuration and the inventory as change notifications arrive.
//!
//! ## Core Concepts
//!
//! - **Package**: an address-selection rule plus the services it enables
//! - **PolledServiceKey**: the (node, address, service) unit of scheduling
//! - **Live tree**: the external structure holding what is scheduled right now
//! - **Reconciliation**: aligning the live tree with inventory and configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pollsync::{ConfigStore, ConfigStoreOptions, EngineConfig, EventKind, FileConfigSource};
//! use pollsync::{MonitorCatalog, Notification, ReconciliationEngine};
//!
//! let mut catalog = MonitorCatalog::new();
//! catalog.declare("icmp", &[]);
//!
//! let config = ConfigStore::load(
//!     Arc::new(FileConfigSource::new("/etc/pollsync/poller-configuration.json")),
//!     catalog,
//!     filter_service,
//!     url_resolver,
//!     ConfigStoreOptions::default(),
//! )?;
//! let engine = ReconciliationEngine::new(
//!     Arc::new(config), live_tree, outage_store, inventory, event_sender,
//!     EngineConfig::default(),
//! );
//! engine.on_notification(&notification)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod event;
pub mod model;
pub mod range;

// Matching and configuration
pub mod config;
pub mod package;
pub mod registry;

// Collaborators and reconciliation
pub mod engine;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use config::{ConfigSource, ConfigStore, ConfigStoreOptions, FileConfigSource, InMemoryConfigSource};
pub use engine::runtime::{DeliveryHandle, NotificationRuntime, RuntimeConfig};
pub use engine::{Disposition, EngineConfig, ReconcileSummary, ReconciliationEngine};
pub use error::{ConfigError, ExecutionError, PollError, PollResult, ValidationError};
pub use event::{EventKind, Notification};
pub use model::{
    DistributionContext, EventId, Monitor, NodeId, NodeOutageConfig, Package, Parameter,
    PolledServiceKey, PollerConfiguration, Rrd, Service,
};
pub use package::{AddressCaches, PackageMatcher};
pub use range::{within_range, AddressRange};
pub use registry::{
    DeclaredMonitor, MonitorCatalog, MonitorFactory, ServiceMonitor, ServiceMonitorLocator,
    ServiceMonitorRegistry,
};
pub use storage::{
    EventSender, FilterService, IncludeUrlResolver, InventoryQuery, KeyState, LiveTree,
    OutageStore, StorageError,
};
