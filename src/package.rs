//! Package membership evaluation.
//!
//! An address belongs to a package when it passes the package filter (the
//! pre-computed candidate cache) and then either:
//! - is a specific address or listed by an include URL, or
//! - falls in an include range (no include ranges and no specifics means
//!   "include everything") and in no exclude range.
//!
//! Specific and include-URL membership override exclusion.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tracing::{debug, trace, warn};

use crate::model::Package;
use crate::storage::{FilterService, IncludeUrlResolver};

/// Derived address caches. Never authoritative; rebuilt from the collaborators.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressCaches {
    package_ips: HashMap<String, HashSet<IpAddr>>,
    url_ips: HashMap<String, HashSet<IpAddr>>,
}

impl AddressCaches {
    /// Create empty caches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate addresses for a package, if any were found.
    #[must_use]
    pub fn candidates(&self, package: &str) -> Option<&HashSet<IpAddr>> {
        self.package_ips.get(package)
    }

    /// Addresses listed by an include URL, if it resolved to any.
    #[must_use]
    pub fn url_addresses(&self, url: &str) -> Option<&HashSet<IpAddr>> {
        self.url_ips.get(url)
    }

    /// Replace the candidate set of a package. Empty sets are not stored.
    pub fn set_candidates(&mut self, package: impl Into<String>, addrs: impl IntoIterator<Item = IpAddr>) {
        let set: HashSet<IpAddr> = addrs.into_iter().collect();
        let package = package.into();
        if set.is_empty() {
            self.package_ips.remove(&package);
        } else {
            self.package_ips.insert(package, set);
        }
    }

    /// Replace the address list of an include URL. Empty lists are not stored.
    pub fn set_url_addresses(&mut self, url: impl Into<String>, addrs: impl IntoIterator<Item = IpAddr>) {
        let set: HashSet<IpAddr> = addrs.into_iter().collect();
        let url = url.into();
        if set.is_empty() {
            self.url_ips.remove(&url);
        } else {
            self.url_ips.insert(url, set);
        }
    }

    /// Replace the whole candidate map.
    pub fn replace_candidates(&mut self, package_ips: HashMap<String, HashSet<IpAddr>>) {
        self.package_ips = package_ips;
    }

    /// Replace the whole include-URL map.
    pub fn replace_urls(&mut self, url_ips: HashMap<String, HashSet<IpAddr>>) {
        self.url_ips = url_ips;
    }

    /// Number of packages with a non-empty candidate set.
    #[must_use]
    pub fn package_count(&self) -> usize {
        self.package_ips.len()
    }
}

/// Evaluates package membership against a fixed package list and cache snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PackageMatcher<'a> {
    packages: &'a [Package],
    caches: &'a AddressCaches,
}

impl<'a> PackageMatcher<'a> {
    /// Matcher over `packages`, in declaration order.
    #[must_use]
    pub const fn new(packages: &'a [Package], caches: &'a AddressCaches) -> Self {
        Self { packages, caches }
    }

    /// Returns true if `addr` belongs to `pkg`.
    #[must_use]
    pub fn is_in_package(&self, addr: &IpAddr, pkg: &Package) -> bool {
        let filter_passed = self
            .caches
            .candidates(&pkg.name)
            .is_some_and(|ips| ips.contains(addr));
        trace!(ip = %addr, package = %pkg.name, filter_passed, "package filter");
        if !filter_passed {
            return false;
        }

        let has_range_include = (pkg.include_ranges.is_empty() && pkg.specifics.is_empty())
            || pkg.include_ranges.iter().any(|r| r.contains(addr));

        let has_specific = pkg.specifics.iter().any(|s| s == addr)
            || pkg.include_urls.iter().any(|url| {
                self.caches
                    .url_addresses(url)
                    .is_some_and(|ips| ips.contains(addr))
            });

        if has_specific {
            return true;
        }

        let has_range_exclude = pkg.exclude_ranges.iter().any(|r| r.contains(addr));
        has_range_include && !has_range_exclude
    }

    /// First package, in declaration order, containing `addr`.
    #[must_use]
    pub fn first_match(&self, addr: &IpAddr) -> Option<&'a Package> {
        self.packages.iter().find(|p| self.is_in_package(addr, p))
    }

    /// Every package containing `addr`, in declaration order.
    #[must_use]
    pub fn all_matches(&self, addr: &IpAddr) -> Vec<&'a Package> {
        self.packages
            .iter()
            .filter(|p| self.is_in_package(addr, p))
            .collect()
    }

    /// First non-remote package containing `addr`.
    #[must_use]
    pub fn first_local_match(&self, addr: &IpAddr) -> Option<&'a Package> {
        self.packages
            .iter()
            .find(|p| !p.remote && self.is_in_package(addr, p))
    }

    /// Every non-remote package containing `addr`.
    #[must_use]
    pub fn all_local_matches(&self, addr: &IpAddr) -> Vec<&'a Package> {
        self.packages
            .iter()
            .filter(|p| !p.remote && self.is_in_package(addr, p))
            .collect()
    }
}

/// Filter expression actually evaluated for a package.
///
/// With a server restriction the expression is narrowed to nodes owned by that server.
#[must_use]
pub fn effective_filter(pkg: &Package, server: Option<&str>) -> String {
    match server {
        Some(server) => format!("({}) & (serverName == \"{server}\")", pkg.filter),
        None => pkg.filter.clone(),
    }
}

/// Evaluates every package filter independently.
///
/// A failing filter is logged and skipped; the other packages still get their sets.
#[must_use]
pub fn build_candidate_cache(
    packages: &[Package],
    filter: &dyn FilterService,
    server: Option<&str>,
) -> HashMap<String, HashSet<IpAddr>> {
    let mut out = HashMap::new();
    for pkg in packages {
        let expression = effective_filter(pkg, server);
        debug!(package = %pkg.name, filter = %expression, "evaluating package filter");
        match filter.candidate_addresses(&expression) {
            Ok(addrs) => {
                debug!(package = %pkg.name, count = addrs.len(), "package candidate addresses");
                if !addrs.is_empty() {
                    out.insert(pkg.name.clone(), addrs.into_iter().collect());
                }
            }
            Err(e) => {
                warn!(package = %pkg.name, error = %e, "failed to map package to an address list");
            }
        }
    }
    out
}

/// Resolves every include URL referenced by the packages.
///
/// Unresolvable URLs are logged and left out.
#[must_use]
pub fn build_url_cache(
    packages: &[Package],
    resolver: &dyn IncludeUrlResolver,
) -> HashMap<String, HashSet<IpAddr>> {
    let mut out: HashMap<String, HashSet<IpAddr>> = HashMap::new();
    for url in packages.iter().flat_map(|p| p.include_urls.iter()) {
        if out.contains_key(url) {
            continue;
        }
        match resolver.resolve(url) {
            Ok(addrs) if !addrs.is_empty() => {
                out.insert(url.clone(), addrs.into_iter().collect());
            }
            Ok(_) => debug!(url = %url, "include url lists no addresses"),
            Err(e) => warn!(url = %url, error = %e, "failed to resolve include url"),
        }
    }
    out
}
