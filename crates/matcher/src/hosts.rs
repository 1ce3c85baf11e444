//! The hosts-override table: static IP overrides for specific domains,
//! grouped so a whole group can be disabled at once (§4.5 rule 1).
//!
//! Grounded on `FireflyHosts` (`hosts.py`): exact-match lookup after IDNA
//! encoding, group-disable check, and IPv6-first/IPv4-only address ordering
//! depending on a once-memoized IPv6-availability flag.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use firefly_core::ForwardDecision;

#[derive(Debug, Clone)]
pub struct HostsEntry {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
    pub redirect: bool,
    pub group: String,
}

#[derive(Debug, Clone, Default)]
pub struct HostsTable {
    entries: HashMap<String, HostsEntry>,
    disabled_groups: HashSet<String>,
    /// Resolved once at construction time by the caller (see DESIGN.md: the
    /// actual `getaddrinfo` probe lives in the daemon crate, which rebuilds
    /// the table — and so re-probes — on each matcher reload).
    has_ipv6: bool,
}

impl HostsTable {
    pub fn new(has_ipv6: bool) -> Self {
        Self {
            entries: HashMap::new(),
            disabled_groups: HashSet::new(),
            has_ipv6,
        }
    }

    pub fn insert(&mut self, host: &str, entry: HostsEntry) {
        let key = idna_key(host);
        self.entries.insert(key, entry);
    }

    pub fn disable_group(&mut self, group: impl Into<String>) {
        self.disabled_groups.insert(group.into());
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Exact-match lookup; re-orders addresses by family per the IPv6
    /// availability flag the table was built with.
    pub fn find(&self, host: &str) -> Option<ForwardDecision> {
        let key = idna_key(host);
        let entry = self.entries.get(&key)?;
        if self.disabled_groups.contains(&entry.group) {
            return None;
        }
        let addrs = self.classify(entry);
        if addrs.is_empty() {
            return None;
        }
        Some(ForwardDecision::HostsOverride { addrs })
    }

    pub fn need_redirect(&self, method: &str, host: &str) -> bool {
        if method != "GET" {
            return false;
        }
        let key = idna_key(host);
        match self.entries.get(&key) {
            Some(entry) => entry.redirect && !self.disabled_groups.contains(&entry.group),
            None => false,
        }
    }

    fn classify(&self, entry: &HostsEntry) -> Vec<IpAddr> {
        let mut out = Vec::new();
        if self.has_ipv6 {
            out.extend(entry.v6.iter().copied().map(IpAddr::V6));
        }
        out.extend(entry.v4.iter().copied().map(IpAddr::V4));
        out
    }
}

fn idna_key(host: &str) -> String {
    idna::domain_to_ascii(host).unwrap_or_else(|_| host.to_ascii_lowercase())
}
