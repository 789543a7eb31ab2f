//! Configuration and identity types.
//!
//! The configuration document is the serde representation of the poller
//! configuration: ordered packages (address selection plus enabled services)
//! and ordered monitor declarations. Package order is significant and is the
//! tie-break for every "first match" query.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::range::AddressRange;

/// Inventory identifier of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Wraps a raw node id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Node id zero is never assigned by the inventory.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u32 = s.trim().parse().map_err(|_| ValidationError::InvalidParameter {
            name: "node_id".to_string(),
            value: s.to_string(),
        })?;
        Ok(Self(id))
    }
}

/// Identity of a notification, used as the event reference when closing outages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit of scheduling: one service on one interface of one node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolledServiceKey {
    /// Owning node.
    pub node_id: NodeId,
    /// Interface address.
    pub ip: IpAddr,
    /// Service name as known to the inventory.
    pub service: String,
}

impl PolledServiceKey {
    /// Builds a key.
    #[must_use]
    pub fn new(node_id: NodeId, ip: IpAddr, service: impl Into<String>) -> Self {
        Self {
            node_id,
            ip,
            service: service.into(),
        }
    }
}

impl fmt::Display for PolledServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node_id, self.ip, self.service)
    }
}

/// Deployment role a monitor implementation may run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionContext {
    /// The central polling daemon.
    Daemon,
    /// A remote collector.
    RemotePoller,
    /// Any role.
    All,
}

impl fmt::Display for DistributionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daemon => write!(f, "daemon"),
            Self::RemotePoller => write!(f, "remote_poller"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Ordered key/value service parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter key.
    pub key: String,
    /// Parameter value.
    pub value: String,
}

impl Parameter {
    /// Builds a parameter.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A service enabled by a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service name.
    pub name: String,
    /// `on`/`off`; absent means on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Polling interval in milliseconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Monitor parameters, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

fn default_interval() -> u64 {
    300_000
}

impl Service {
    /// Creates an enabled service with the default interval.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: None,
            interval: default_interval(),
            parameters: Vec::new(),
        }
    }

    /// Sets the status string.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Appends a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(key, value));
        self
    }

    /// Returns true if the status is absent or `on`.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status.as_deref().map_or(true, |s| s == "on")
    }

    /// Returns the first parameter value stored under `key`.
    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }
}

/// Round-robin archive settings for a package's response-time data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rrd {
    /// Step in seconds.
    pub step: u32,
    /// Archive definitions.
    #[serde(default)]
    pub rra: Vec<String>,
}

impl Default for Rrd {
    fn default() -> Self {
        Self {
            step: 300,
            rra: vec![
                "RRA:AVERAGE:0.5:1:2016".to_string(),
                "RRA:AVERAGE:0.5:12:1488".to_string(),
            ],
        }
    }
}

/// Named configuration unit: address selection plus enabled services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Unique package name.
    pub name: String,
    /// Filter expression, evaluated by the filter collaborator.
    pub filter: String,
    /// Explicit addresses; membership overrides exclude ranges.
    #[serde(default)]
    pub specifics: Vec<IpAddr>,
    /// Inclusive include ranges, evaluated in order.
    #[serde(default)]
    pub include_ranges: Vec<AddressRange>,
    /// Inclusive exclude ranges.
    #[serde(default)]
    pub exclude_ranges: Vec<AddressRange>,
    /// References to address lists; membership overrides exclude ranges.
    #[serde(default)]
    pub include_urls: Vec<String>,
    /// Polled by a remote collector rather than this instance.
    #[serde(default)]
    pub remote: bool,
    /// Response-time archive settings.
    #[serde(default)]
    pub rrd: Rrd,
    /// Enabled services, in declaration order.
    #[serde(default)]
    pub services: Vec<Service>,
}

impl Package {
    /// Creates a package with a filter and no rules.
    #[must_use]
    pub fn new(name: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: filter.into(),
            specifics: Vec::new(),
            include_ranges: Vec::new(),
            exclude_ranges: Vec::new(),
            include_urls: Vec::new(),
            remote: false,
            rrd: Rrd::default(),
            services: Vec::new(),
        }
    }

    /// Looks up a service by exact name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Returns true if a service with a case-insensitively equal name is enabled.
    #[must_use]
    pub fn is_service_enabled(&self, name: &str) -> bool {
        self.services
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(name) && s.is_enabled())
    }
}

/// Monitor declaration: which implementation polls a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitor {
    /// Service name.
    pub service: String,
    /// Implementation identifier, resolved against the monitor catalog.
    pub implementation: String,
}

impl Monitor {
    /// Builds a monitor declaration.
    #[must_use]
    pub fn new(service: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            implementation: implementation.into(),
        }
    }
}

/// Node-outage processing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutageConfig {
    /// `on` or `off`.
    pub status: String,
    /// Service whose loss marks the whole node down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_service: Option<String>,
    /// Poll every service when no critical service is defined.
    #[serde(default)]
    pub poll_all_if_no_critical_service_defined: bool,
}

impl Default for NodeOutageConfig {
    fn default() -> Self {
        Self {
            status: "on".to_string(),
            critical_service: Some("ICMP".to_string()),
            poll_all_if_no_critical_service_defined: false,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerConfiguration {
    /// Poller thread count.
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Emit unresponsive rather than down for slow TCP services.
    #[serde(default)]
    pub service_unresponsive_enabled: bool,
    /// Track path outages.
    #[serde(default)]
    pub path_outage_enabled: bool,
    /// Node-outage settings.
    #[serde(default)]
    pub node_outage: NodeOutageConfig,
    /// Packages in declaration order.
    #[serde(default)]
    pub packages: Vec<Package>,
    /// Monitor declarations in declaration order.
    #[serde(default)]
    pub monitors: Vec<Monitor>,
}

fn default_threads() -> u32 {
    30
}

impl Default for PollerConfiguration {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            service_unresponsive_enabled: false,
            path_outage_enabled: false,
            node_outage: NodeOutageConfig::default(),
            packages: Vec::new(),
            monitors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_status_defaults_to_enabled() {
        assert!(Service::new("ICMP").is_enabled());
        assert!(Service::new("ICMP").with_status("on").is_enabled());
        assert!(!Service::new("ICMP").with_status("off").is_enabled());
    }

    #[test]
    fn package_service_enabled_ignores_case() {
        let mut pkg = Package::new("example1", "IPADDR != '0.0.0.0'");
        pkg.services.push(Service::new("HTTP"));
        pkg.services.push(Service::new("SNMP").with_status("off"));

        assert!(pkg.is_service_enabled("http"));
        assert!(!pkg.is_service_enabled("SNMP"));
        assert!(!pkg.is_service_enabled("SSH"));
    }

    #[test]
    fn service_parameter_returns_first_match() {
        let svc = Service::new("HTTP")
            .with_parameter("port", "80")
            .with_parameter("port", "8080");
        assert_eq!(svc.parameter("port"), Some("80"));
        assert_eq!(svc.parameter("url"), None);
    }

    #[test]
    fn node_id_parsing() {
        assert_eq!("42".parse::<NodeId>().unwrap(), NodeId::new(42));
        assert!("forty-two".parse::<NodeId>().is_err());
        assert!(!NodeId::new(0).is_valid());
    }

    #[test]
    fn configuration_deserializes_with_defaults() {
        let json = r#"{
            "packages": [{
                "name": "example1",
                "filter": "IPADDR != '0.0.0.0'",
                "include_ranges": [{"begin": "10.0.0.1", "end": "10.0.0.10"}],
                "services": [{"name": "ICMP"}]
            }],
            "monitors": [{"service": "ICMP", "implementation": "icmp"}]
        }"#;
        let cfg: PollerConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.threads, 30);
        assert_eq!(cfg.packages[0].services[0].interval, 300_000);
        assert_eq!(cfg.packages[0].rrd.step, 300);
        assert!(!cfg.packages[0].remote);
        assert_eq!(cfg.monitors[0].implementation, "icmp");
    }
}
