//! Collaborator contracts.
//!
//! The engine never owns the live monitored-service tree, the outage store or
//! the inventory. These traits are the seams to those systems:
//! - In-memory backends for tests and embedded use
//! - Database and scheduler backends in production

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::Notification;
use crate::model::{EventId, NodeId, PolledServiceKey};

/// Errors that can occur inside a collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Node not tracked.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Interface not tracked under the node.
    #[error("Interface {ip} not found on node {node_id}")]
    InterfaceNotFound {
        /// Owning node.
        node_id: NodeId,
        /// Interface address.
        ip: IpAddr,
    },

    /// Service not tracked.
    #[error("Service not found: {0}")]
    ServiceNotFound(PolledServiceKey),

    /// Filter expression could not be evaluated.
    #[error("Filter error: {0}")]
    FilterError(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Scheduling state of a key in the live tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// Not present.
    Untracked,
    /// Actively polled.
    Scheduled,
    /// Deletion requested, not yet confirmed.
    PendingDelete,
}

/// A node as tracked by the live tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedNode {
    /// Node id.
    pub id: NodeId,
    /// Display label.
    pub label: Option<String>,
    /// Monitoring location.
    pub location: Option<String>,
}

/// Request to start polling a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    /// What to poll.
    pub key: PolledServiceKey,
    /// Label to record if the node entry has to be created.
    pub node_label: Option<String>,
    /// Location to record if the node entry has to be created.
    pub node_location: Option<String>,
    /// Package the poll settings come from.
    pub package: String,
}

/// The runtime structure holding currently scheduled targets (nodes, interfaces, services).
///
/// Deletion is asynchronous: `delete*` only requests removal, completion is
/// observed through [`LiveTree::service_state`] returning `Untracked`.
pub trait LiveTree: Send + Sync {
    /// Ids of every tracked node.
    fn node_ids(&self) -> Result<Vec<NodeId>, StorageError>;

    /// Get a tracked node.
    fn node(&self, id: NodeId) -> Result<Option<TrackedNode>, StorageError>;

    /// Returns true if the interface is tracked under the node.
    fn has_interface(&self, node_id: NodeId, ip: IpAddr) -> Result<bool, StorageError>;

    /// Current state of a key. This is the single source of truth for "already scheduled".
    fn service_state(&self, key: &PolledServiceKey) -> Result<KeyState, StorageError>;

    /// Every key tracked under the node, including keys pending deletion.
    fn services(&self, node_id: NodeId) -> Result<Vec<PolledServiceKey>, StorageError>;

    /// Schedule a key, creating node and interface entries as needed.
    ///
    /// Returns false without side effects if the key is already present.
    fn schedule(&self, request: ScheduleRequest) -> Result<bool, StorageError>;

    /// Request asynchronous removal of a key.
    fn delete(&self, key: &PolledServiceKey) -> Result<(), StorageError>;

    /// Request asynchronous removal of an interface and all its services.
    fn delete_interface(&self, node_id: NodeId, ip: IpAddr) -> Result<(), StorageError>;

    /// Request asynchronous removal of a node subtree.
    fn delete_node(&self, node_id: NodeId) -> Result<(), StorageError>;

    /// Move an interface, with its services, under another node without rescheduling.
    fn reparent_interface(&self, ip: IpAddr, from: NodeId, to: NodeId) -> Result<(), StorageError>;

    /// Update the label of a tracked node.
    fn set_node_label(&self, node_id: NodeId, label: &str) -> Result<(), StorageError>;
}

/// Outage persistence. Every close returns the number of outages closed.
pub trait OutageStore: Send + Sync {
    /// Close every open outage on the node.
    fn close_outages_for_node(
        &self,
        closed_at: DateTime<Utc>,
        event_id: EventId,
        node_id: NodeId,
    ) -> Result<usize, StorageError>;

    /// Close every open outage on the interface.
    fn close_outages_for_interface(
        &self,
        closed_at: DateTime<Utc>,
        event_id: EventId,
        node_id: NodeId,
        ip: IpAddr,
    ) -> Result<usize, StorageError>;

    /// Close the open outage on a single key.
    fn close_outages_for_service(
        &self,
        closed_at: DateTime<Utc>,
        event_id: EventId,
        key: &PolledServiceKey,
    ) -> Result<usize, StorageError>;
}

/// Authoritative inventory.
pub trait InventoryQuery: Send + Sync {
    /// Every (address, service) pair the inventory records for the node.
    fn node_services(&self, node_id: NodeId) -> Result<Vec<(IpAddr, String)>, StorageError>;

    /// Node label.
    fn node_label(&self, node_id: NodeId) -> Result<Option<String>, StorageError>;

    /// Node monitoring location.
    fn node_location(&self, node_id: NodeId) -> Result<Option<String>, StorageError>;
}

/// Evaluates package filter expressions against the inventory.
pub trait FilterService: Send + Sync {
    /// Addresses satisfying the expression.
    fn candidate_addresses(&self, filter: &str) -> Result<Vec<IpAddr>, StorageError>;
}

/// Resolves a package include-URL to an address list.
pub trait IncludeUrlResolver: Send + Sync {
    /// Addresses listed at `url`.
    fn resolve(&self, url: &str) -> Result<Vec<IpAddr>, StorageError>;
}

/// Outbound notifications (reload outcomes).
pub trait EventSender: Send + Sync {
    /// Publish a notification.
    fn send(&self, notification: Notification) -> Result<(), StorageError>;
}
