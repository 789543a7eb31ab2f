use std::net::IpAddr;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use pollsync::storage::{FileIpListResolver, StaticFilterService};
use pollsync::{
    AddressCaches, AddressRange, ConfigStore, ConfigStoreOptions, Monitor, MonitorCatalog,
    Package, PackageMatcher, PollerConfiguration, Service,
};

const PACKAGES: u8 = 32;

fn filter_for(i: u8) -> String {
    format!("categoryName == 'site-{i}'")
}

// One package per /24 under 10.<i>.0.0, each carving out an exclude range and a few specifics.
fn packages() -> Vec<Package> {
    (0..PACKAGES)
        .map(|i| {
            let mut pkg = Package::new(format!("site-{i}"), filter_for(i));
            pkg.include_ranges.push(AddressRange::new(
                IpAddr::from([10, i, 0, 0]),
                IpAddr::from([10, i, 0, 255]),
            ));
            pkg.exclude_ranges.push(AddressRange::new(
                IpAddr::from([10, i, 0, 100]),
                IpAddr::from([10, i, 0, 120]),
            ));
            pkg.specifics.push(IpAddr::from([10, i, 0, 110]));
            pkg.services = vec![Service::new("ICMP"), Service::new("SNMP")];
            pkg
        })
        .collect()
}

fn candidates(i: u8) -> Vec<IpAddr> {
    (0..=255u8).map(|b| IpAddr::from([10, i, 0, b])).collect()
}

fn bench_matcher(c: &mut Criterion) {
    let packages = packages();
    let mut caches = AddressCaches::new();
    for i in 0..PACKAGES {
        caches.set_candidates(format!("site-{i}"), candidates(i));
    }
    let matcher = PackageMatcher::new(&packages, &caches);
    let last = IpAddr::from([10, PACKAGES - 1, 0, 42]);
    let miss = IpAddr::from([192, 168, 0, 1]);

    let mut group = c.benchmark_group("matching");
    group.throughput(Throughput::Elements(1));

    group.bench_function("is_in_package", |b| {
        b.iter(|| matcher.is_in_package(black_box(&last), &packages[usize::from(PACKAGES) - 1]));
    });
    group.bench_function("first_match_last_package", |b| {
        b.iter(|| matcher.first_match(black_box(&last)));
    });
    group.bench_function("first_match_miss", |b| {
        b.iter(|| matcher.first_match(black_box(&miss)));
    });
    group.finish();
}

fn bench_config_store(c: &mut Criterion) {
    let doc = PollerConfiguration {
        packages: packages(),
        monitors: vec![Monitor::new("ICMP", "icmp"), Monitor::new("SNMP", "snmp")],
        ..PollerConfiguration::default()
    };
    let filter = StaticFilterService::new();
    for i in 0..PACKAGES {
        filter.set_filter(&filter_for(i), candidates(i)).unwrap();
    }
    let mut catalog = MonitorCatalog::new();
    catalog.declare("icmp", &[]).declare("snmp", &[]);
    let store = ConfigStore::load(
        Arc::new(pollsync::InMemoryConfigSource::new(&doc).unwrap()),
        catalog,
        Arc::new(filter),
        Arc::new(FileIpListResolver::new()),
        ConfigStoreOptions::default(),
    )
    .unwrap();
    let addr = IpAddr::from([10, PACKAGES / 2, 0, 7]);

    let mut group = c.benchmark_group("config_store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("is_service_polled", |b| {
        b.iter(|| store.is_service_polled(black_box(&addr), black_box("SNMP")));
    });
    group.bench_function("first_local_package_for_service", |b| {
        b.iter(|| store.first_local_package_for_service(black_box(&addr), "ICMP"));
    });
    group.finish();
}

criterion_group!(matching, bench_matcher, bench_config_store);
criterion_main!(matching);
