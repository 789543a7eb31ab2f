//! In-memory collaborator backends.
//!
//! This module provides thread-safe in-memory implementations of the collaborator
//! traits. It is intended for embedded usage, tests, and as a reference implementation.
//! [`InMemoryLiveTree`] executes deletions on its own worker thread so callers
//! observe the same asynchronous removal a production scheduler exhibits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, trace};

use crate::event::Notification;
use crate::model::{EventId, NodeId, PolledServiceKey};

use super::traits::{
    EventSender, FilterService, InventoryQuery, KeyState, LiveTree, OutageStore, ScheduleRequest,
    StorageError, TrackedNode,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Mutation recorded by [`InMemoryLiveTree`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeOp {
    Schedule(PolledServiceKey),
    Delete(PolledServiceKey),
    DeleteInterface { node_id: NodeId, ip: IpAddr },
    DeleteNode(NodeId),
    Reparent { ip: IpAddr, from: NodeId, to: NodeId },
    SetLabel { node_id: NodeId, label: String },
}

/// Live tree behavior knobs.
#[derive(Debug, Clone)]
pub struct LiveTreeConfig {
    /// Delay applied by the deleter before each removal.
    pub deletion_delay: Duration,
    /// Never confirm deletions (keys stay pending forever).
    pub stall_deletions: bool,
    /// Max queued deletion requests.
    pub queue_capacity: usize,
}

impl Default for LiveTreeConfig {
    fn default() -> Self {
        Self {
            deletion_delay: Duration::ZERO,
            stall_deletions: false,
            queue_capacity: 1024,
        }
    }
}

type ServiceMap = BTreeMap<String, KeyState>;

#[derive(Debug, Default)]
struct NodeEntry {
    label: Option<String>,
    location: Option<String>,
    interfaces: BTreeMap<IpAddr, ServiceMap>,
}

#[derive(Debug, Default)]
struct TreeState {
    nodes: BTreeMap<NodeId, NodeEntry>,
    ops: Vec<TreeOp>,
}

impl TreeState {
    fn state_of(&self, key: &PolledServiceKey) -> KeyState {
        self.nodes
            .get(&key.node_id)
            .and_then(|n| n.interfaces.get(&key.ip))
            .and_then(|svcs| svcs.get(&key.service))
            .copied()
            .unwrap_or(KeyState::Untracked)
    }

    /// Drops pending services matching the scope, then prunes empty interfaces and nodes.
    fn remove_pending(&mut self, node_id: NodeId, ip: Option<IpAddr>, service: Option<&str>) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        for (addr, svcs) in &mut node.interfaces {
            if ip.is_some_and(|ip| ip != *addr) {
                continue;
            }
            svcs.retain(|name, state| {
                let in_scope = service.map_or(true, |s| s == name.as_str());
                !(in_scope && *state == KeyState::PendingDelete)
            });
        }
        node.interfaces.retain(|_, svcs| !svcs.is_empty());
        if node.interfaces.is_empty() {
            self.nodes.remove(&node_id);
        }
    }
}

#[derive(Debug)]
enum DeleteMsg {
    Service(PolledServiceKey),
    Interface { node_id: NodeId, ip: IpAddr },
    Node(NodeId),
}

/// Thread-safe in-memory live tree with asynchronous deletion.
#[derive(Debug)]
pub struct InMemoryLiveTree {
    state: Arc<RwLock<TreeState>>,
    delete_tx: Sender<DeleteMsg>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Default for InMemoryLiveTree {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLiveTree {
    /// Create an empty tree with immediate deletion.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LiveTreeConfig::default())
    }

    /// Create an empty tree with explicit deletion behavior.
    #[must_use]
    pub fn with_config(cfg: LiveTreeConfig) -> Self {
        let state = Arc::new(RwLock::new(TreeState::default()));
        let (delete_tx, delete_rx) = bounded::<DeleteMsg>(cfg.queue_capacity.max(1));

        let thread_state = Arc::clone(&state);
        let join = thread::Builder::new()
            .name("pollsync-deleter".to_string())
            .spawn(move || deleter_loop(&cfg, &thread_state, &delete_rx))
            .expect("failed to spawn pollsync deleter");

        Self {
            state,
            delete_tx,
            join: Mutex::new(Some(join)),
        }
    }

    /// Mutations applied so far, oldest first.
    pub fn operations(&self) -> Result<Vec<TreeOp>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("tree.operations"))?;
        Ok(state.ops.clone())
    }

    /// Forget recorded mutations.
    pub fn clear_operations(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("tree.clear_operations"))?;
        state.ops.clear();
        Ok(())
    }

    /// Every tracked key in the tree, sorted.
    pub fn all_services(&self) -> Result<Vec<PolledServiceKey>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("tree.all_services"))?;
        let mut out = Vec::new();
        for (node_id, node) in &state.nodes {
            for (ip, svcs) in &node.interfaces {
                out.extend(svcs.keys().map(|s| PolledServiceKey::new(*node_id, *ip, s.clone())));
            }
        }
        Ok(out)
    }

    fn enqueue(&self, msg: DeleteMsg) -> Result<(), StorageError> {
        self.delete_tx
            .send(msg)
            .map_err(|_| StorageError::BackendError("deleter disconnected".to_string()))
    }
}

impl Drop for InMemoryLiveTree {
    fn drop(&mut self) {
        // Close the channel so the deleter exits, then join it.
        let (dummy_tx, _) = bounded::<DeleteMsg>(1);
        drop(std::mem::replace(&mut self.delete_tx, dummy_tx));

        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

fn deleter_loop(cfg: &LiveTreeConfig, state: &RwLock<TreeState>, rx: &Receiver<DeleteMsg>) {
    for msg in rx.iter() {
        if cfg.stall_deletions {
            continue;
        }
        if !cfg.deletion_delay.is_zero() {
            thread::sleep(cfg.deletion_delay);
        }
        let Ok(mut state) = state.write() else {
            break;
        };
        trace!(?msg, "applying deletion");
        match msg {
            DeleteMsg::Service(key) => state.remove_pending(key.node_id, Some(key.ip), Some(&key.service)),
            DeleteMsg::Interface { node_id, ip } => state.remove_pending(node_id, Some(ip), None),
            DeleteMsg::Node(node_id) => state.remove_pending(node_id, None, None),
        }
    }
}

impl LiveTree for InMemoryLiveTree {
    fn node_ids(&self) -> Result<Vec<NodeId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("tree.node_ids"))?;
        Ok(state.nodes.keys().copied().collect())
    }

    fn node(&self, id: NodeId) -> Result<Option<TrackedNode>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("tree.node"))?;
        Ok(state.nodes.get(&id).map(|n| TrackedNode {
            id,
            label: n.label.clone(),
            location: n.location.clone(),
        }))
    }

    fn has_interface(&self, node_id: NodeId, ip: IpAddr) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("tree.has_interface"))?;
        Ok(state
            .nodes
            .get(&node_id)
            .is_some_and(|n| n.interfaces.contains_key(&ip)))
    }

    fn service_state(&self, key: &PolledServiceKey) -> Result<KeyState, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("tree.service_state"))?;
        Ok(state.state_of(key))
    }

    fn services(&self, node_id: NodeId) -> Result<Vec<PolledServiceKey>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("tree.services"))?;
        let Some(node) = state.nodes.get(&node_id) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (ip, svcs) in &node.interfaces {
            out.extend(svcs.keys().map(|s| PolledServiceKey::new(node_id, *ip, s.clone())));
        }
        Ok(out)
    }

    fn schedule(&self, request: ScheduleRequest) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("tree.schedule"))?;
        if state.state_of(&request.key) != KeyState::Untracked {
            return Ok(false);
        }
        let key = request.key;
        let node = state.nodes.entry(key.node_id).or_insert_with(|| NodeEntry {
            label: request.node_label,
            location: request.node_location,
            interfaces: BTreeMap::new(),
        });
        node.interfaces
            .entry(key.ip)
            .or_default()
            .insert(key.service.clone(), KeyState::Scheduled);
        debug!(%key, package = %request.package, "scheduled");
        state.ops.push(TreeOp::Schedule(key));
        Ok(true)
    }

    fn delete(&self, key: &PolledServiceKey) -> Result<(), StorageError> {
        {
            let mut state = self.state.write().map_err(|_| lock_err("tree.delete"))?;
            let slot = state
                .nodes
                .get_mut(&key.node_id)
                .and_then(|n| n.interfaces.get_mut(&key.ip))
                .and_then(|svcs| svcs.get_mut(&key.service))
                .ok_or_else(|| StorageError::ServiceNotFound(key.clone()))?;
            if *slot == KeyState::PendingDelete {
                return Ok(());
            }
            *slot = KeyState::PendingDelete;
            state.ops.push(TreeOp::Delete(key.clone()));
        }
        self.enqueue(DeleteMsg::Service(key.clone()))
    }

    fn delete_interface(&self, node_id: NodeId, ip: IpAddr) -> Result<(), StorageError> {
        {
            let mut state = self.state.write().map_err(|_| lock_err("tree.delete_interface"))?;
            let svcs = state
                .nodes
                .get_mut(&node_id)
                .and_then(|n| n.interfaces.get_mut(&ip))
                .ok_or(StorageError::InterfaceNotFound { node_id, ip })?;
            svcs.values_mut().for_each(|s| *s = KeyState::PendingDelete);
            state.ops.push(TreeOp::DeleteInterface { node_id, ip });
        }
        self.enqueue(DeleteMsg::Interface { node_id, ip })
    }

    fn delete_node(&self, node_id: NodeId) -> Result<(), StorageError> {
        {
            let mut state = self.state.write().map_err(|_| lock_err("tree.delete_node"))?;
            let node = state
                .nodes
                .get_mut(&node_id)
                .ok_or(StorageError::NodeNotFound(node_id))?;
            for svcs in node.interfaces.values_mut() {
                svcs.values_mut().for_each(|s| *s = KeyState::PendingDelete);
            }
            state.ops.push(TreeOp::DeleteNode(node_id));
        }
        self.enqueue(DeleteMsg::Node(node_id))
    }

    fn reparent_interface(&self, ip: IpAddr, from: NodeId, to: NodeId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("tree.reparent_interface"))?;
        if !state.nodes.contains_key(&to) {
            return Err(StorageError::NodeNotFound(to));
        }
        let old = state.nodes.get_mut(&from).ok_or(StorageError::NodeNotFound(from))?;
        if !old.interfaces.contains_key(&ip) {
            return Err(StorageError::InterfaceNotFound { node_id: from, ip });
        }
        if from == to {
            return Ok(());
        }
        let svcs = old.interfaces.remove(&ip).unwrap_or_default();
        if old.interfaces.is_empty() {
            state.nodes.remove(&from);
        }

        // Queued deletions are keyed by the old node, so pending services are
        // confirmed gone here instead of being carried over.
        let (pending, moved): (ServiceMap, ServiceMap) = svcs
            .into_iter()
            .partition(|(_, s)| *s == KeyState::PendingDelete);
        if !pending.is_empty() {
            trace!(%ip, %from, dropped = pending.len(), "dropping pending services of reparented interface");
        }
        if !moved.is_empty() {
            if let Some(new) = state.nodes.get_mut(&to) {
                new.interfaces.entry(ip).or_default().extend(moved);
            }
        }
        state.ops.push(TreeOp::Reparent { ip, from, to });
        Ok(())
    }

    fn set_node_label(&self, node_id: NodeId, label: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("tree.set_node_label"))?;
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or(StorageError::NodeNotFound(node_id))?;
        node.label = Some(label.to_string());
        state.ops.push(TreeOp::SetLabel {
            node_id,
            label: label.to_string(),
        });
        Ok(())
    }
}

/// One outage held by [`InMemoryOutageStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutageRecord {
    /// Affected key.
    pub key: PolledServiceKey,
    /// When the outage opened.
    pub opened_at: DateTime<Utc>,
    /// When it closed, if it has.
    pub closed_at: Option<DateTime<Utc>>,
    /// Notification that closed it.
    pub closed_by: Option<EventId>,
}

impl OutageRecord {
    /// Returns true if still open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

#[derive(Debug, Default)]
struct OutageState {
    outages: Vec<OutageRecord>,
    close_calls: usize,
}

impl OutageState {
    fn close_where(
        &mut self,
        closed_at: DateTime<Utc>,
        event_id: EventId,
        pred: impl Fn(&PolledServiceKey) -> bool,
    ) -> usize {
        self.close_calls += 1;
        let mut closed = 0;
        for o in self.outages.iter_mut().filter(|o| o.is_open() && pred(&o.key)) {
            o.closed_at = Some(closed_at);
            o.closed_by = Some(event_id);
            closed += 1;
        }
        closed
    }
}

/// Thread-safe in-memory outage store.
#[derive(Debug, Default)]
pub struct InMemoryOutageStore {
    state: RwLock<OutageState>,
}

impl InMemoryOutageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an outage on `key`; no-op if one is already open.
    pub fn open_outage(&self, key: PolledServiceKey, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("outage.open"))?;
        if state.outages.iter().any(|o| o.is_open() && o.key == key) {
            return Ok(());
        }
        state.outages.push(OutageRecord {
            key,
            opened_at: at,
            closed_at: None,
            closed_by: None,
        });
        Ok(())
    }

    /// Every outage ever recorded.
    pub fn outages(&self) -> Result<Vec<OutageRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("outage.outages"))?;
        Ok(state.outages.clone())
    }

    /// Keys with an open outage.
    pub fn open_keys(&self) -> Result<Vec<PolledServiceKey>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("outage.open_keys"))?;
        Ok(state
            .outages
            .iter()
            .filter(|o| o.is_open())
            .map(|o| o.key.clone())
            .collect())
    }

    /// Number of close requests received, matching or not.
    pub fn close_calls(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("outage.close_calls"))?;
        Ok(state.close_calls)
    }
}

impl OutageStore for InMemoryOutageStore {
    fn close_outages_for_node(
        &self,
        closed_at: DateTime<Utc>,
        event_id: EventId,
        node_id: NodeId,
    ) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("outage.close_node"))?;
        Ok(state.close_where(closed_at, event_id, |k| k.node_id == node_id))
    }

    fn close_outages_for_interface(
        &self,
        closed_at: DateTime<Utc>,
        event_id: EventId,
        node_id: NodeId,
        ip: IpAddr,
    ) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("outage.close_interface"))?;
        Ok(state.close_where(closed_at, event_id, |k| k.node_id == node_id && k.ip == ip))
    }

    fn close_outages_for_service(
        &self,
        closed_at: DateTime<Utc>,
        event_id: EventId,
        key: &PolledServiceKey,
    ) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("outage.close_service"))?;
        Ok(state.close_where(closed_at, event_id, |k| k == key))
    }
}

#[derive(Debug, Default, Clone)]
struct InventoryNode {
    label: Option<String>,
    location: Option<String>,
    services: Vec<(IpAddr, String)>,
}

/// Thread-safe in-memory inventory.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    nodes: RwLock<BTreeMap<NodeId, InventoryNode>>,
}

impl InMemoryInventory {
    /// Create an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or relabel a node.
    pub fn add_node(&self, node_id: NodeId, label: &str, location: Option<&str>) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write().map_err(|_| lock_err("inventory.add_node"))?;
        let node = nodes.entry(node_id).or_default();
        node.label = Some(label.to_string());
        node.location = location.map(str::to_string);
        Ok(())
    }

    /// Record a service on an interface; duplicates are ignored.
    pub fn add_service(&self, node_id: NodeId, ip: IpAddr, service: &str) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write().map_err(|_| lock_err("inventory.add_service"))?;
        let node = nodes.entry(node_id).or_default();
        if !node.services.iter().any(|(a, s)| *a == ip && s == service) {
            node.services.push((ip, service.to_string()));
        }
        Ok(())
    }

    /// Remove a service from an interface.
    pub fn remove_service(&self, node_id: NodeId, ip: IpAddr, service: &str) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write().map_err(|_| lock_err("inventory.remove_service"))?;
        if let Some(node) = nodes.get_mut(&node_id) {
            node.services.retain(|(a, s)| !(*a == ip && s == service));
        }
        Ok(())
    }

    /// Change a node's location.
    pub fn set_location(&self, node_id: NodeId, location: &str) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write().map_err(|_| lock_err("inventory.set_location"))?;
        let node = nodes.get_mut(&node_id).ok_or(StorageError::NodeNotFound(node_id))?;
        node.location = Some(location.to_string());
        Ok(())
    }

    /// Remove a node and its services.
    pub fn remove_node(&self, node_id: NodeId) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write().map_err(|_| lock_err("inventory.remove_node"))?;
        nodes.remove(&node_id);
        Ok(())
    }
}

impl InventoryQuery for InMemoryInventory {
    fn node_services(&self, node_id: NodeId) -> Result<Vec<(IpAddr, String)>, StorageError> {
        let nodes = self.nodes.read().map_err(|_| lock_err("inventory.node_services"))?;
        Ok(nodes.get(&node_id).map(|n| n.services.clone()).unwrap_or_default())
    }

    fn node_label(&self, node_id: NodeId) -> Result<Option<String>, StorageError> {
        let nodes = self.nodes.read().map_err(|_| lock_err("inventory.node_label"))?;
        Ok(nodes.get(&node_id).and_then(|n| n.label.clone()))
    }

    fn node_location(&self, node_id: NodeId) -> Result<Option<String>, StorageError> {
        let nodes = self.nodes.read().map_err(|_| lock_err("inventory.node_location"))?;
        Ok(nodes.get(&node_id).and_then(|n| n.location.clone()))
    }
}

/// Filter service backed by a fixed expression → address table.
///
/// Unknown expressions evaluate to no addresses.
#[derive(Debug, Default)]
pub struct StaticFilterService {
    results: RwLock<HashMap<String, Vec<IpAddr>>>,
    failing: RwLock<HashSet<String>>,
    queries: Mutex<Vec<String>>,
}

impl StaticFilterService {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StaticFilterService::set_filter`].
    #[must_use]
    pub fn with_filter(self, filter: &str, addrs: Vec<IpAddr>) -> Self {
        if let Ok(mut results) = self.results.write() {
            results.insert(filter.to_string(), addrs);
        }
        self
    }

    /// Set the addresses an expression evaluates to.
    pub fn set_filter(&self, filter: &str, addrs: Vec<IpAddr>) -> Result<(), StorageError> {
        let mut results = self.results.write().map_err(|_| lock_err("filter.set_filter"))?;
        results.insert(filter.to_string(), addrs);
        Ok(())
    }

    /// Make an expression fail to evaluate.
    pub fn fail_on(&self, filter: &str) -> Result<(), StorageError> {
        let mut failing = self.failing.write().map_err(|_| lock_err("filter.fail_on"))?;
        failing.insert(filter.to_string());
        Ok(())
    }

    /// Expressions evaluated so far, oldest first.
    pub fn queries(&self) -> Result<Vec<String>, StorageError> {
        let queries = self.queries.lock().map_err(|_| lock_err("filter.queries"))?;
        Ok(queries.clone())
    }
}

impl FilterService for StaticFilterService {
    fn candidate_addresses(&self, filter: &str) -> Result<Vec<IpAddr>, StorageError> {
        self.queries
            .lock()
            .map_err(|_| lock_err("filter.candidate_addresses"))?
            .push(filter.to_string());
        let failing = self.failing.read().map_err(|_| lock_err("filter.candidate_addresses"))?;
        if failing.contains(filter) {
            return Err(StorageError::FilterError(format!("cannot evaluate '{filter}'")));
        }
        let results = self.results.read().map_err(|_| lock_err("filter.candidate_addresses"))?;
        Ok(results.get(filter).cloned().unwrap_or_default())
    }
}

/// Event sender that keeps every notification it is given.
#[derive(Debug, Default)]
pub struct RecordingEventSender {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingEventSender {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far, oldest first.
    pub fn sent(&self) -> Result<Vec<Notification>, StorageError> {
        let sent = self.sent.lock().map_err(|_| lock_err("sender.sent"))?;
        Ok(sent.clone())
    }
}

impl EventSender for RecordingEventSender {
    fn send(&self, notification: Notification) -> Result<(), StorageError> {
        let mut sent = self.sent.lock().map_err(|_| lock_err("sender.send"))?;
        sent.push(notification);
        Ok(())
    }
}
