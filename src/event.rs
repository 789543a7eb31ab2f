//! Change notifications.
//!
//! A notification is a discrete inventory or administrative change delivered
//! by the notification bus. The reconciliation engine is the only consumer.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::model::{EventId, NodeId, Parameter};

/// Well-known notification parameter names.
pub mod params {
    /// Previous owner of a reparented interface.
    pub const OLD_NODE_ID: &str = "old_node_id";
    /// New owner of a reparented interface.
    pub const NEW_NODE_ID: &str = "new_node_id";
    /// Node label carried by inventory notifications.
    pub const NODE_LABEL: &str = "node_label";
    /// Replacement label on a label change.
    pub const NEW_NODE_LABEL: &str = "new_node_label";
    /// Target daemon of a reload request.
    pub const DAEMON_NAME: &str = "daemon_name";
    /// Configuration file named in reload outcomes.
    pub const CONFIG_FILE: &str = "config_file";
    /// Failure reason in reload outcomes.
    pub const REASON: &str = "reason";
}

/// Notification kinds understood by the engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeGainedService,
    ResumePollingService,
    SuspendPollingService,
    ServiceDeleted,
    InterfaceReparented,
    InterfaceDeleted,
    NodeDeleted,
    DuplicateNodeDeleted,
    NodeLabelChanged,
    NodeCategoryMembershipChanged,
    AssetInfoChanged,
    NodeLocationChanged,
    ScheduledOutagesChanged,
    ThresholdConfigChanged,
    ReloadDaemonConfig,
    ReloadDaemonConfigSuccessful,
    ReloadDaemonConfigFailed,
}

impl EventKind {
    /// Kinds the engine subscribes to.
    pub const SUBSCRIBED: &'static [EventKind] = &[
        Self::NodeGainedService,
        Self::ResumePollingService,
        Self::SuspendPollingService,
        Self::ServiceDeleted,
        Self::InterfaceReparented,
        Self::InterfaceDeleted,
        Self::NodeDeleted,
        Self::DuplicateNodeDeleted,
        Self::NodeLabelChanged,
        Self::NodeCategoryMembershipChanged,
        Self::AssetInfoChanged,
        Self::NodeLocationChanged,
        Self::ScheduledOutagesChanged,
        Self::ThresholdConfigChanged,
        Self::ReloadDaemonConfig,
    ];

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NodeGainedService => "node_gained_service",
            Self::ResumePollingService => "resume_polling_service",
            Self::SuspendPollingService => "suspend_polling_service",
            Self::ServiceDeleted => "service_deleted",
            Self::InterfaceReparented => "interface_reparented",
            Self::InterfaceDeleted => "interface_deleted",
            Self::NodeDeleted => "node_deleted",
            Self::DuplicateNodeDeleted => "duplicate_node_deleted",
            Self::NodeLabelChanged => "node_label_changed",
            Self::NodeCategoryMembershipChanged => "node_category_membership_changed",
            Self::AssetInfoChanged => "asset_info_changed",
            Self::NodeLocationChanged => "node_location_changed",
            Self::ScheduledOutagesChanged => "scheduled_outages_changed",
            Self::ThresholdConfigChanged => "threshold_config_changed",
            Self::ReloadDaemonConfig => "reload_daemon_config",
            Self::ReloadDaemonConfigSuccessful => "reload_daemon_config_successful",
            Self::ReloadDaemonConfigFailed => "reload_daemon_config_failed",
        }
    }

    /// Returns true if the engine handles this kind.
    #[must_use]
    pub fn is_subscribed(self) -> bool {
        Self::SUBSCRIBED.contains(&self)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| {
            ValidationError::UnknownKind {
                value: s.to_string(),
            }
        })
    }
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Event identity, passed to the outage store when closing outages.
    pub id: EventId,
    /// What changed.
    pub kind: EventKind,
    /// Subject node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Subject interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<IpAddr>,
    /// Subject service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Free-form parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Parameter>,
    /// When the change happened; also the close time of any outage it resolves.
    pub time: DateTime<Utc>,
    /// Transaction id of the change in the source system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
}

impl Notification {
    /// Creates a notification of `kind` stamped now.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self::at(kind, Utc::now())
    }

    /// Creates a notification of `kind` stamped at `time`.
    #[must_use]
    pub fn at(kind: EventKind, time: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            kind,
            node_id: None,
            interface: None,
            service: None,
            params: Vec::new(),
            time,
            transaction_id: None,
        }
    }

    /// Sets the subject node.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Sets the subject interface.
    #[must_use]
    pub fn with_interface(mut self, ip: IpAddr) -> Self {
        self.interface = Some(ip);
        self
    }

    /// Sets the subject service.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Appends a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(Parameter::new(key, value));
        self
    }

    /// Sets the source transaction id.
    #[must_use]
    pub fn with_transaction(mut self, transaction_id: i64) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    /// Node id, treating zero as absent.
    #[must_use]
    pub fn valid_node_id(&self) -> Option<NodeId> {
        self.node_id.filter(|id| id.is_valid())
    }

    /// First value of the named parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.key == name)
            .map(|p| p.value.as_str())
    }

    /// Parses the named parameter as a node id.
    pub fn node_id_param(&self, name: &str) -> Result<NodeId, ValidationError> {
        let raw = self.param(name).ok_or_else(|| ValidationError::MissingParameter {
            name: name.to_string(),
        })?;
        raw.parse::<NodeId>().map_err(|_| ValidationError::InvalidParameter {
            name: name.to_string(),
            value: raw.to_string(),
        })
    }

    pub(crate) fn require_node(&self) -> Result<NodeId, ValidationError> {
        self.valid_node_id().ok_or_else(|| ValidationError::MissingNodeId {
            kind: self.kind.to_string(),
        })
    }

    pub(crate) fn require_interface(&self) -> Result<IpAddr, ValidationError> {
        self.interface.ok_or_else(|| ValidationError::MissingInterface {
            kind: self.kind.to_string(),
        })
    }

    pub(crate) fn require_service(&self) -> Result<&str, ValidationError> {
        self.service
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingService {
                kind: self.kind.to_string(),
            })
    }
}
