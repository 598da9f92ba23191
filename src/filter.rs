//! Hostname allow-list consulted before a URL may enter the frontier.

use std::collections::HashSet;

use parking_lot::RwLock;
use url::Url;

/// Set of hostnames the crawler is allowed to visit.
///
/// Hosts are registered before the engine starts; lookups run concurrently
/// from every worker.
#[derive(Debug, Default)]
pub struct HostFilter {
    hosts: RwLock<HashSet<String>>,
}

impl HostFilter {
    /// Creates an empty filter that matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hostname, lowercased to match `Url` host canonicalization.
    pub fn add_host(&self, host: &str) {
        self.hosts.write().insert(host.to_ascii_lowercase());
    }

    /// Returns true iff the URL carries a host and that host is registered.
    pub fn matches(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.hosts.read().contains(host))
    }
}
