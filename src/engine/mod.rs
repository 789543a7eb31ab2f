//! Reconciliation engine.
//!
//! The engine consumes change notifications and keeps the live tree aligned
//! with what the inventory and the configuration say must be polled. Every
//! transition is idempotent: the live tree's own key presence is the single
//! source of truth for "already scheduled", so replaying a notification, or
//! delivering several for the same node concurrently, converges to the same
//! state.

/// Multi-worker notification delivery.
pub mod runtime;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConfigStore;
use crate::error::{ExecutionError, PollError, PollResult, ValidationError};
use crate::event::{params, EventKind, Notification};
use crate::model::{NodeId, PolledServiceKey};
use crate::storage::{
    EventSender, InventoryQuery, KeyState, LiveTree, OutageStore, ScheduleRequest, StorageError,
};

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interval between deletion-confirmation checks.
    pub delete_poll_interval: Duration,
    /// Longest wait for a deletion to be confirmed.
    pub delete_timeout: Duration,
    /// Reload requests are honored only when their `daemon_name` matches (case-insensitive).
    pub daemon_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delete_poll_interval: Duration::from_millis(20),
            delete_timeout: Duration::from_secs(30),
            daemon_name: "pollerd".to_string(),
        }
    }
}

/// What the engine did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The transition was applied (possibly as a no-op because it had already taken effect).
    Applied,
    /// The notification was dropped and will not be retried.
    Discarded {
        /// Why.
        reason: String,
    },
    /// The kind is not one the engine subscribes to.
    Ignored,
}

impl Disposition {
    fn discarded(reason: impl Into<String>) -> Self {
        Self::Discarded {
            reason: reason.into(),
        }
    }

    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// Returns true if the notification was dropped.
    #[must_use]
    pub const fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded { .. })
    }
}

/// Outcome of a full reconciliation of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Keys removed because the inventory no longer lists them.
    pub removed: Vec<PolledServiceKey>,
    /// Keys deleted only to be scheduled again.
    pub rescheduled: Vec<PolledServiceKey>,
    /// Keys newly scheduled.
    pub scheduled: Vec<PolledServiceKey>,
    /// Keys listed by the inventory that no local package polls.
    pub unpolled: Vec<PolledServiceKey>,
}

/// Event-driven reconciliation of the live tree.
pub struct ReconciliationEngine {
    config: Arc<ConfigStore>,
    tree: Arc<dyn LiveTree>,
    outages: Arc<dyn OutageStore>,
    inventory: Arc<dyn InventoryQuery>,
    events: Arc<dyn EventSender>,
    settings: EngineConfig,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("config", &self.config)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    /// Create an engine over the given collaborators.
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        tree: Arc<dyn LiveTree>,
        outages: Arc<dyn OutageStore>,
        inventory: Arc<dyn InventoryQuery>,
        events: Arc<dyn EventSender>,
        settings: EngineConfig,
    ) -> Self {
        Self {
            config,
            tree,
            outages,
            inventory,
            events,
            settings,
        }
    }

    /// The configuration store.
    #[must_use]
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Engine tunables.
    #[must_use]
    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    /// Single entry point for every transition.
    ///
    /// Malformed notifications are discarded rather than reported as errors.
    /// Errors are collaborator failures, deletion-confirmation timeouts and
    /// configuration reload failures.
    pub fn on_notification(&self, n: &Notification) -> PollResult<Disposition> {
        debug!(kind = %n.kind, id = %n.id, "received notification");

        match n.kind {
            EventKind::ScheduledOutagesChanged => return self.scheduled_outages_changed(n),
            EventKind::ReloadDaemonConfig => return self.reload_config(n),
            EventKind::ThresholdConfigChanged => {
                debug!("threshold configuration changed; nothing to reschedule");
                return Ok(Disposition::Applied);
            }
            kind if !kind.is_subscribed() => return Ok(Disposition::Ignored),
            _ => {}
        }

        let node_id = match n.require_node() {
            Ok(id) => id,
            Err(e) => return Ok(discard(n, &e)),
        };

        match n.kind {
            EventKind::NodeGainedService | EventKind::ResumePollingService => self.gained(n, node_id),
            EventKind::SuspendPollingService | EventKind::ServiceDeleted => self.service_removed(n, node_id),
            EventKind::InterfaceReparented => self.interface_reparented(n),
            EventKind::InterfaceDeleted => self.interface_deleted(n, node_id),
            EventKind::NodeDeleted | EventKind::DuplicateNodeDeleted => self.node_deleted(n, node_id),
            EventKind::NodeLabelChanged => self.node_label_changed(n, node_id),
            EventKind::NodeCategoryMembershipChanged | EventKind::AssetInfoChanged => {
                self.config.rebuild_candidate_cache()?;
                self.reconcile(node_id, false, n)?;
                Ok(Disposition::Applied)
            }
            EventKind::NodeLocationChanged => {
                // Location decides which instance owns the node, so existing schedules are redone.
                self.config.rebuild_candidate_cache()?;
                self.reconcile(node_id, true, n)?;
                Ok(Disposition::Applied)
            }
            EventKind::ScheduledOutagesChanged
            | EventKind::ReloadDaemonConfig
            | EventKind::ThresholdConfigChanged
            | EventKind::ReloadDaemonConfigSuccessful
            | EventKind::ReloadDaemonConfigFailed => Ok(Disposition::Ignored),
        }
    }

    fn gained(&self, n: &Notification, node_id: NodeId) -> PollResult<Disposition> {
        let (ip, service) = match subject(n) {
            Ok(s) => s,
            Err(e) => return Ok(discard(n, &e)),
        };
        let key = PolledServiceKey::new(node_id, ip, service);

        match self.tree.service_state(&key)? {
            KeyState::Scheduled => {
                debug!(%key, "service gained but it is already being polled");
                return Ok(Disposition::Applied);
            }
            KeyState::PendingDelete => {
                debug!(%key, "service gained while its removal is pending; waiting");
                self.await_deletion(&key)?;
            }
            KeyState::Untracked => {}
        }

        let label = self.node_label(node_id, n);
        let location = self.node_location(node_id);
        self.schedule_service(&key, label, location)?;
        Ok(Disposition::Applied)
    }

    fn service_removed(&self, n: &Notification, node_id: NodeId) -> PollResult<Disposition> {
        let (ip, service) = match subject(n) {
            Ok(s) => s,
            Err(e) => return Ok(discard(n, &e)),
        };
        let key = PolledServiceKey::new(node_id, ip, service);

        self.outages.close_outages_for_service(n.time, n.id, &key)?;

        match self.tree.service_state(&key)? {
            KeyState::Untracked => {
                error!(%key, "service does not exist in the live tree; unable to delete it");
                Ok(Disposition::discarded(format!("service {key} is not tracked")))
            }
            KeyState::PendingDelete => {
                debug!(%key, "service removal already pending");
                Ok(Disposition::Applied)
            }
            KeyState::Scheduled => {
                self.request_delete(&key)?;
                debug!(%key, "service removal requested");
                Ok(Disposition::Applied)
            }
        }
    }

    fn interface_reparented(&self, n: &Notification) -> PollResult<Disposition> {
        let ip = match n.require_interface() {
            Ok(ip) => ip,
            Err(e) => return Ok(discard(n, &e)),
        };
        let ids = n
            .node_id_param(params::OLD_NODE_ID)
            .and_then(|old| Ok((old, n.node_id_param(params::NEW_NODE_ID)?)));
        let (old, new) = match ids {
            Ok(ids) => ids,
            Err(e) => {
                error!(%ip, error = %e, "old and new node ids are required to reparent an interface");
                return Ok(Disposition::discarded(e.to_string()));
            }
        };
        if old == new {
            warn!(node_id = %old, %ip, "interface reparented onto its current node; nothing to move");
            return Ok(Disposition::Applied);
        }

        if self.tree.node(old)?.is_none() {
            error!(node_id = %old, %ip, "cannot locate old node of reparented interface");
            return Ok(Disposition::discarded(format!("old node {old} is not tracked")));
        }
        if self.tree.node(new)?.is_none() {
            error!(node_id = %new, %ip, "cannot locate new node to move interface to");
            return Ok(Disposition::discarded(format!("new node {new} is not tracked")));
        }
        if !self.tree.has_interface(old, ip)? {
            error!(node_id = %old, %ip, "cannot locate interface to reparent");
            return Ok(Disposition::discarded(format!("interface {ip} is not tracked on node {old}")));
        }

        self.tree.reparent_interface(ip, old, new)?;
        debug!(%ip, from = %old, to = %new, "interface reparented");
        Ok(Disposition::Applied)
    }

    fn interface_deleted(&self, n: &Notification, node_id: NodeId) -> PollResult<Disposition> {
        let ip = match n.require_interface() {
            Ok(ip) => ip,
            Err(e) => return Ok(discard(n, &e)),
        };

        self.outages.close_outages_for_interface(n.time, n.id, node_id, ip)?;

        if !self.tree.has_interface(node_id, ip)? {
            error!(%node_id, %ip, "interface does not exist in the live tree; unable to delete it");
            return Ok(Disposition::discarded(format!("interface {ip} is not tracked on node {node_id}")));
        }
        self.tree.delete_interface(node_id, ip)?;
        debug!(%node_id, %ip, "interface removal requested");
        Ok(Disposition::Applied)
    }

    fn node_deleted(&self, n: &Notification, node_id: NodeId) -> PollResult<Disposition> {
        let closed = self.outages.close_outages_for_node(n.time, n.id, node_id)?;
        debug!(%node_id, closed, "closed node outages");

        if self.tree.node(node_id)?.is_none() {
            error!(%node_id, "node does not exist in the live tree; unable to delete it");
            return Ok(Disposition::discarded(format!("node {node_id} is not tracked")));
        }
        self.tree.delete_node(node_id)?;
        debug!(%node_id, "node removal requested");
        Ok(Disposition::Applied)
    }

    fn node_label_changed(&self, n: &Notification, node_id: NodeId) -> PollResult<Disposition> {
        let Some(label) = n.param(params::NEW_NODE_LABEL) else {
            let e = ValidationError::MissingParameter {
                name: params::NEW_NODE_LABEL.to_string(),
            };
            return Ok(discard(n, &e));
        };
        if self.tree.node(node_id)?.is_none() {
            warn!(%node_id, "node does not exist in the live tree; unable to update its label");
            return Ok(Disposition::discarded(format!("node {node_id} is not tracked")));
        }
        self.tree.set_node_label(node_id, label)?;
        debug!(%node_id, label, "node label updated");
        Ok(Disposition::Applied)
    }

    fn scheduled_outages_changed(&self, n: &Notification) -> PollResult<Disposition> {
        info!("scheduled outages changed; reloading configuration");
        if let Err(e) = self.config.reload() {
            error!(error = %e, "failed to reload poller configuration");
        }
        self.reschedule_all(n)?;
        Ok(Disposition::Applied)
    }

    fn reload_config(&self, n: &Notification) -> PollResult<Disposition> {
        let targeted = n
            .param(params::DAEMON_NAME)
            .is_some_and(|d| d.eq_ignore_ascii_case(&self.settings.daemon_name));
        if !targeted {
            warn!(daemon = ?n.param(params::DAEMON_NAME), "reload request is not addressed to this daemon");
            return Ok(Disposition::discarded("reload request names another daemon"));
        }

        info!("reloading poller configuration");
        let result = self.config.reload().and_then(|()| self.reschedule_all(n));

        let outcome = match &result {
            Ok(()) => Notification::at(EventKind::ReloadDaemonConfigSuccessful, Utc::now()),
            Err(e) => {
                error!(error = %e, "error reloading poller configuration");
                Notification::at(EventKind::ReloadDaemonConfigFailed, Utc::now())
                    .with_param(params::REASON, e.to_string())
            }
        }
        .with_param(params::DAEMON_NAME, self.settings.daemon_name.clone())
        .with_param(params::CONFIG_FILE, self.config.location());

        if let Err(e) = self.events.send(outcome) {
            error!(error = %e, "failed to send reload outcome");
        }
        result.map(|()| Disposition::Applied)
    }

    /// Rebuild the candidate cache, then force-reconcile every tracked node.
    ///
    /// A node whose reconciliation fails is logged and skipped.
    pub fn reschedule_all(&self, n: &Notification) -> PollResult<()> {
        info!("poller configuration changed; rescheduling services");
        self.config.rebuild_candidate_cache()?;
        for node_id in self.tree.node_ids()? {
            if let Err(e) = self.reconcile(node_id, true, n) {
                error!(%node_id, error = %e, "failed to reschedule node services");
            }
        }
        Ok(())
    }

    /// Align the live tree entries of one node with the inventory.
    ///
    /// With `force` every already-tracked key is deleted and scheduled again.
    pub fn reconcile(&self, node_id: NodeId, force: bool, n: &Notification) -> PollResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let database: BTreeSet<PolledServiceKey> = self
            .inventory
            .node_services(node_id)?
            .into_iter()
            .map(|(ip, svc)| PolledServiceKey::new(node_id, ip, svc))
            .collect();
        let polled: BTreeSet<PolledServiceKey> = self.tree.services(node_id)?.into_iter().collect();
        debug!(%node_id, database = database.len(), polled = polled.len(), force, "reconciling node");
        trace!(%node_id, ?database, ?polled, "service sets");

        let label = match self.tree.node(node_id)? {
            Some(tracked) if tracked.label.is_some() => tracked.label,
            _ => self.node_label(node_id, n),
        };
        let location = self.node_location(node_id);

        for key in polled.difference(&database) {
            debug!(%key, "no longer in inventory; removing and resolving outages");
            self.remove_and_wait(key)?;
            self.outages.close_outages_for_service(n.time, n.id, key)?;
            summary.removed.push(key.clone());
        }

        // Keys whose removal was already pending are scheduled afresh once it completes.
        let mut kept = BTreeSet::new();
        for key in polled.intersection(&database) {
            let pending = self.tree.service_state(key)? == KeyState::PendingDelete;
            if force || pending {
                self.remove_and_wait(key)?;
                summary.rescheduled.push(key.clone());
            } else {
                kept.insert(key.clone());
            }
        }

        for key in database.difference(&kept) {
            if self.schedule_service(key, label.clone(), location.clone())? {
                summary.scheduled.push(key.clone());
            }
            if !self.config.is_service_polled(&key.ip, &key.service) {
                debug!(%key, "not polled; closing any pending outages");
                self.outages.close_outages_for_service(n.time, n.id, key)?;
                summary.unpolled.push(key.clone());
            }
        }

        Ok(summary)
    }

    /// Schedule a key under the first local package that polls it.
    ///
    /// Returns false if no package polls it or it is already scheduled.
    pub fn schedule_service(
        &self,
        key: &PolledServiceKey,
        node_label: Option<String>,
        node_location: Option<String>,
    ) -> PollResult<bool> {
        let Some(pkg) = self.config.first_local_package_for_service(&key.ip, &key.service) else {
            debug!(%key, "no local package polls this service; not scheduling");
            return Ok(false);
        };
        let scheduled = self.tree.schedule(ScheduleRequest {
            key: key.clone(),
            node_label,
            node_location,
            package: pkg.name.clone(),
        })?;
        if scheduled {
            debug!(%key, package = %pkg.name, "scheduled service");
        } else {
            debug!(%key, "service already scheduled");
        }
        Ok(scheduled)
    }

    /// Poll the live tree until the key is gone.
    pub fn await_deletion(&self, key: &PolledServiceKey) -> PollResult<()> {
        let started = Instant::now();
        loop {
            if self.tree.service_state(key)? == KeyState::Untracked {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.settings.delete_timeout {
                return Err(ExecutionError::DeletionTimeout {
                    key: key.clone(),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                }
                .into());
            }
            thread::sleep(self.settings.delete_poll_interval);
        }
    }

    fn request_delete(&self, key: &PolledServiceKey) -> PollResult<()> {
        match self.tree.delete(key) {
            // Removed concurrently.
            Ok(()) | Err(StorageError::ServiceNotFound(_)) => Ok(()),
            Err(e) => Err(PollError::from(e)),
        }
    }

    fn remove_and_wait(&self, key: &PolledServiceKey) -> PollResult<()> {
        if self.tree.service_state(key)? == KeyState::Scheduled {
            self.request_delete(key)?;
        }
        self.await_deletion(key)
    }

    fn node_label(&self, node_id: NodeId, n: &Notification) -> Option<String> {
        let fallback = || n.param(params::NODE_LABEL).map(str::to_string);
        match self.inventory.node_label(node_id) {
            Ok(label) => label.or_else(fallback),
            Err(e) => {
                error!(%node_id, error = %e, "unable to retrieve node label");
                fallback()
            }
        }
    }

    fn node_location(&self, node_id: NodeId) -> Option<String> {
        self.inventory.node_location(node_id).unwrap_or_else(|e| {
            error!(%node_id, error = %e, "unable to retrieve node location");
            None
        })
    }
}

fn subject(n: &Notification) -> Result<(IpAddr, String), ValidationError> {
    let ip = n.require_interface()?;
    let service = n.require_service()?.to_string();
    Ok((ip, service))
}

fn discard(n: &Notification, e: &ValidationError) -> Disposition {
    info!(kind = %n.kind, id = %n.id, reason = %e, "discarding notification");
    Disposition::discarded(e.to_string())
}
