use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use pollsync::event::params;
use pollsync::storage::{
    FileIpListResolver, InMemoryInventory, InMemoryLiveTree, InMemoryOutageStore, LiveTreeConfig,
    RecordingEventSender, StaticFilterService, TreeOp,
};
use pollsync::{
    AddressRange, ConfigStore, ConfigStoreOptions, DistributionContext, EngineConfig, EventKind,
    InMemoryConfigSource, KeyState, LiveTree, Monitor, MonitorCatalog, NodeId, Notification,
    NotificationRuntime, Package, PollerConfiguration, PolledServiceKey, ReconciliationEngine,
    RuntimeConfig, Service,
};

const ALL: &str = "IPADDR != '0.0.0.0'";

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn key(node: u32, addr: &str, svc: &str) -> PolledServiceKey {
    PolledServiceKey::new(NodeId::new(node), ip(addr), svc)
}

struct Harness {
    engine: Arc<ReconciliationEngine>,
    tree: Arc<InMemoryLiveTree>,
    outages: Arc<InMemoryOutageStore>,
    inventory: Arc<InMemoryInventory>,
}

fn harness() -> Harness {
    // 10.0.0.0/24 is polled for ICMP, HTTP and SNMP; 10.0.0.200-10.0.0.255 has HTTP disabled.
    let mut main = Package::new("main", ALL);
    main.include_ranges
        .push(AddressRange::new(ip("10.0.0.1"), ip("10.0.0.199")));
    main.services = vec![Service::new("ICMP"), Service::new("HTTP"), Service::new("SNMP")];
    let mut quiet = Package::new("quiet", ALL);
    quiet
        .include_ranges
        .push(AddressRange::new(ip("10.0.0.200"), ip("10.0.0.255")));
    quiet.services = vec![Service::new("ICMP"), Service::new("HTTP").with_status("off")];

    let doc = PollerConfiguration {
        packages: vec![main, quiet],
        monitors: vec![
            Monitor::new("ICMP", "icmp"),
            Monitor::new("HTTP", "http"),
            Monitor::new("SNMP", "snmp"),
        ],
        ..PollerConfiguration::default()
    };
    let mut catalog = MonitorCatalog::new();
    catalog
        .declare("icmp", &[DistributionContext::All])
        .declare("http", &[])
        .declare("snmp", &[]);
    let candidates = (1..=254u8).map(|b| IpAddr::from([10, 0, 0, b])).collect();
    let config = ConfigStore::load(
        Arc::new(InMemoryConfigSource::new(&doc).unwrap()),
        catalog,
        Arc::new(StaticFilterService::new().with_filter(ALL, candidates)),
        Arc::new(FileIpListResolver::new()),
        ConfigStoreOptions::default(),
    )
    .unwrap();

    let tree = Arc::new(InMemoryLiveTree::with_config(LiveTreeConfig {
        deletion_delay: Duration::from_millis(2),
        ..LiveTreeConfig::default()
    }));
    let outages = Arc::new(InMemoryOutageStore::new());
    let inventory = Arc::new(InMemoryInventory::new());
    let engine = ReconciliationEngine::new(
        Arc::new(config),
        Arc::clone(&tree) as Arc<dyn LiveTree>,
        Arc::clone(&outages) as Arc<dyn pollsync::OutageStore>,
        Arc::clone(&inventory) as Arc<dyn pollsync::InventoryQuery>,
        Arc::new(RecordingEventSender::new()),
        EngineConfig::default(),
    );
    Harness {
        engine: Arc::new(engine),
        tree,
        outages,
        inventory,
    }
}

fn gained(node: u32, addr: &str, svc: &str) -> Notification {
    Notification::new(EventKind::NodeGainedService)
        .with_node(NodeId::new(node))
        .with_interface(ip(addr))
        .with_service(svc)
}

fn tracked(h: &Harness, node: u32) -> BTreeSet<PolledServiceKey> {
    h.tree.services(NodeId::new(node)).unwrap().into_iter().collect()
}

#[test]
fn add_scenario_schedules_only_the_missing_service() {
    let h = harness();
    let node = NodeId::new(1);
    h.inventory.add_node(node, "edge-1", Some("Default")).unwrap();
    h.inventory.add_service(node, ip("10.0.0.1"), "HTTP").unwrap();
    h.inventory.add_service(node, ip("10.0.0.1"), "SNMP").unwrap();
    h.engine.on_notification(&gained(1, "10.0.0.1", "HTTP")).unwrap();
    h.tree.clear_operations().unwrap();

    let n = Notification::new(EventKind::NodeCategoryMembershipChanged).with_node(node);
    h.engine.on_notification(&n).unwrap();

    assert_eq!(
        h.tree.operations().unwrap(),
        vec![TreeOp::Schedule(key(1, "10.0.0.1", "SNMP"))]
    );
    assert_eq!(
        tracked(&h, 1),
        [key(1, "10.0.0.1", "HTTP"), key(1, "10.0.0.1", "SNMP")].into_iter().collect()
    );
}

#[test]
fn deleting_an_untracked_node_only_closes_node_outages() {
    let h = harness();
    let n = Notification::new(EventKind::NodeDeleted).with_node(NodeId::new(42));
    let disposition = h.engine.on_notification(&n).unwrap();

    assert!(disposition.is_discarded());
    assert!(h.tree.operations().unwrap().is_empty());
    assert_eq!(h.outages.close_calls().unwrap(), 1);
}

#[test]
fn node_deletion_removes_subtree_and_outages() {
    let h = harness();
    h.engine.on_notification(&gained(1, "10.0.0.1", "ICMP")).unwrap();
    h.engine.on_notification(&gained(1, "10.0.0.2", "HTTP")).unwrap();
    h.outages.open_outage(key(1, "10.0.0.2", "HTTP"), Utc::now()).unwrap();

    let n = Notification::new(EventKind::DuplicateNodeDeleted).with_node(NodeId::new(1));
    assert!(h.engine.on_notification(&n).unwrap().is_applied());
    h.engine.await_deletion(&key(1, "10.0.0.1", "ICMP")).unwrap();
    h.engine.await_deletion(&key(1, "10.0.0.2", "HTTP")).unwrap();

    assert!(h.tree.node(NodeId::new(1)).unwrap().is_none());
    assert!(h.outages.open_keys().unwrap().is_empty());
}

#[test]
fn reparent_moves_interface_without_rescheduling() {
    let h = harness();
    h.engine.on_notification(&gained(1, "10.0.0.1", "ICMP")).unwrap();
    h.engine.on_notification(&gained(2, "10.0.0.2", "ICMP")).unwrap();
    h.tree.clear_operations().unwrap();

    let n = Notification::new(EventKind::InterfaceReparented)
        .with_node(NodeId::new(2))
        .with_interface(ip("10.0.0.1"))
        .with_param(params::OLD_NODE_ID, "1")
        .with_param(params::NEW_NODE_ID, "2");
    assert!(h.engine.on_notification(&n).unwrap().is_applied());

    assert_eq!(
        h.tree.operations().unwrap(),
        vec![TreeOp::Reparent {
            ip: ip("10.0.0.1"),
            from: NodeId::new(1),
            to: NodeId::new(2),
        }]
    );
    assert!(tracked(&h, 1).is_empty());
    assert!(tracked(&h, 2).contains(&key(2, "10.0.0.1", "ICMP")));
}

#[test]
fn reparent_to_unknown_node_is_discarded() {
    let h = harness();
    h.engine.on_notification(&gained(1, "10.0.0.1", "ICMP")).unwrap();
    h.tree.clear_operations().unwrap();

    let n = Notification::new(EventKind::InterfaceReparented)
        .with_node(NodeId::new(9))
        .with_interface(ip("10.0.0.1"))
        .with_param(params::OLD_NODE_ID, "1")
        .with_param(params::NEW_NODE_ID, "9");
    assert!(h.engine.on_notification(&n).unwrap().is_discarded());

    let bad = Notification::new(EventKind::InterfaceReparented)
        .with_node(NodeId::new(9))
        .with_interface(ip("10.0.0.1"))
        .with_param(params::OLD_NODE_ID, "one");
    assert!(h.engine.on_notification(&bad).unwrap().is_discarded());
    assert!(h.tree.operations().unwrap().is_empty());
}

#[test]
fn interface_deletion_closes_outages_and_removes_interface() {
    let h = harness();
    h.engine.on_notification(&gained(1, "10.0.0.1", "ICMP")).unwrap();
    h.engine.on_notification(&gained(1, "10.0.0.2", "ICMP")).unwrap();
    h.outages.open_outage(key(1, "10.0.0.1", "ICMP"), Utc::now()).unwrap();

    let n = Notification::new(EventKind::InterfaceDeleted)
        .with_node(NodeId::new(1))
        .with_interface(ip("10.0.0.1"));
    assert!(h.engine.on_notification(&n).unwrap().is_applied());
    h.engine.await_deletion(&key(1, "10.0.0.1", "ICMP")).unwrap();

    assert_eq!(tracked(&h, 1), [key(1, "10.0.0.2", "ICMP")].into_iter().collect());
    assert!(h.outages.open_keys().unwrap().is_empty());
}

#[test]
fn reconciliation_converges_to_polled_inventory() {
    let h = harness();
    let node = NodeId::new(7);
    let inventory = [
        ("10.0.0.1", "ICMP"),
        ("10.0.0.1", "HTTP"),
        ("10.0.0.201", "ICMP"),
        ("10.0.0.201", "HTTP"), // disabled in its package
        ("10.0.0.3", "DNS"),    // no monitor
        ("192.168.0.1", "ICMP"), // outside every package
    ];
    for (addr, svc) in inventory {
        h.inventory.add_service(node, ip(addr), svc).unwrap();
    }
    // Stale entry the inventory no longer lists.
    h.engine.on_notification(&gained(7, "10.0.0.2", "SNMP")).unwrap();

    let n = Notification::new(EventKind::AssetInfoChanged).with_node(node);
    h.engine.reconcile(node, false, &n).unwrap();

    let config = h.engine.config();
    let expected: BTreeSet<PolledServiceKey> = inventory
        .iter()
        .filter(|(addr, svc)| config.is_service_polled_locally(&ip(addr), svc))
        .map(|(addr, svc)| key(7, addr, svc))
        .collect();
    assert_eq!(tracked(&h, 7), expected);
    assert_eq!(expected.len(), 3);

    // A second pass changes nothing.
    h.tree.clear_operations().unwrap();
    h.engine.reconcile(node, false, &n).unwrap();
    assert!(h.tree.operations().unwrap().is_empty());
}

#[test]
fn no_open_outage_outlives_its_key() {
    let h = harness();
    let node = NodeId::new(3);
    for svc in ["ICMP", "HTTP", "SNMP"] {
        h.inventory.add_service(node, ip("10.0.0.3"), svc).unwrap();
        h.engine.on_notification(&gained(3, "10.0.0.3", svc)).unwrap();
        h.outages.open_outage(key(3, "10.0.0.3", svc), Utc::now()).unwrap();
    }
    h.inventory.remove_service(node, ip("10.0.0.3"), "SNMP").unwrap();

    let suspend = Notification::new(EventKind::SuspendPollingService)
        .with_node(node)
        .with_interface(ip("10.0.0.3"))
        .with_service("HTTP");
    h.engine.on_notification(&suspend).unwrap();
    h.engine.await_deletion(&key(3, "10.0.0.3", "HTTP")).unwrap();

    let n = Notification::new(EventKind::AssetInfoChanged).with_node(node);
    h.engine.on_notification(&n).unwrap();

    for open in h.outages.open_keys().unwrap() {
        assert_eq!(h.tree.service_state(&open).unwrap(), KeyState::Scheduled, "{open} has a dangling outage");
    }
}

#[test]
fn concurrent_delivery_converges() {
    let h = harness();
    let runtime = NotificationRuntime::with_shared(
        Arc::clone(&h.engine),
        RuntimeConfig {
            workers: 8,
            queue_capacity: 512,
        },
    );

    let mut handles = Vec::new();
    for round in 0..4 {
        for b in 1..=20u8 {
            let addr = format!("10.0.0.{b}");
            let svc = if round % 2 == 0 { "ICMP" } else { "HTTP" };
            handles.push(runtime.dispatch(gained(u32::from(b), &addr, svc)).unwrap());
        }
    }
    for handle in handles {
        assert!(handle.join().unwrap().is_applied());
    }
    runtime.shutdown();

    let all = h.tree.all_services().unwrap();
    assert_eq!(all.len(), 40);
    let unique: BTreeSet<_> = all.iter().collect();
    assert_eq!(unique.len(), all.len());
}
