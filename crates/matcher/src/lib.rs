//! Forwarding policy (the "matcher", §4.5): hosts override, custom allow/deny,
//! blacklist suffix match, channel fallback — composed behind a single
//! `find()` operation, published as immutable snapshots (§4.5, §9, §5).

mod blacklist;
mod glob;
mod hosts;

pub use blacklist::BlacklistMatcher;
pub use hosts::{HostsEntry, HostsTable};

use std::sync::Arc;

use firefly_core::{Destination, ForwardDecision, Proto};
use parking_lot::RwLock;

/// A single immutable snapshot of the forwarding policy. Grounded on
/// `FireflyMatcher.find`/`need_redirect` (`matcher.py`): hosts table wins
/// unconditionally, otherwise falls through to the blacklist matcher, else
/// `Direct`.
#[derive(Debug, Clone)]
pub struct Matcher {
    hosts: HostsTable,
    blacklist: BlacklistMatcher,
}

impl Matcher {
    pub fn new(hosts: HostsTable, blacklist: BlacklistMatcher) -> Self {
        Self { hosts, blacklist }
    }

    pub fn find(&self, destination: &Destination) -> ForwardDecision {
        if let Some(decision) = self.hosts.find(&destination.host) {
            return decision;
        }
        if destination.proto == Proto::Tcp || destination.proto == Proto::Udp {
            if let Some(decision) = self.blacklist.find(&destination.host) {
                return decision;
            }
        }
        ForwardDecision::Direct
    }

    pub fn need_redirect(&self, method: &str, host: &str) -> bool {
        self.hosts.need_redirect(method, host)
    }
}

/// A publishable, swappable holder for the current `Matcher` snapshot.
/// `load()` returns the `Arc` a session should capture and keep using for
/// its entire lifetime (§5 "Matcher snapshots"); `publish()` swaps in a new
/// snapshot atomically without disturbing sessions that already captured
/// the old one.
#[derive(Debug)]
pub struct MatcherHandle {
    current: RwLock<Arc<Matcher>>,
}

impl MatcherHandle {
    pub fn new(matcher: Matcher) -> Self {
        Self {
            current: RwLock::new(Arc::new(matcher)),
        }
    }

    pub fn load(&self) -> Arc<Matcher> {
        self.current.read().clone()
    }

    pub fn publish(&self, matcher: Matcher) {
        *self.current.write() = Arc::new(matcher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn matcher() -> Matcher {
        let mut hosts = HostsTable::new(false);
        hosts.insert(
            "foo.test",
            HostsEntry {
                v4: vec!["93.184.216.34".parse().unwrap()],
                v6: vec![],
                redirect: true,
                group: "default".to_string(),
            },
        );
        let blacklist = BlacklistMatcher::new(
            HashSet::from(["censored.test".to_string()]),
            vec![],
            vec![],
            "socks5://127.0.0.1:9000",
        );
        Matcher::new(hosts, blacklist)
    }

    #[test]
    fn test_hosts_table_wins_over_blacklist() {
        let m = matcher();
        let dest = Destination::new("foo.test", 80, Proto::Tcp);
        assert!(matches!(m.find(&dest), ForwardDecision::HostsOverride { .. }));
    }

    #[test]
    fn test_blacklist_fallback() {
        let m = matcher();
        let dest = Destination::new("www.censored.test", 443, Proto::Tcp);
        assert!(matches!(m.find(&dest), ForwardDecision::Channel { .. }));
    }

    #[test]
    fn test_default_direct() {
        let m = matcher();
        let dest = Destination::new("example.com", 443, Proto::Tcp);
        assert_eq!(m.find(&dest), ForwardDecision::Direct);
    }

    #[test]
    fn test_handle_publish_swaps_snapshot() {
        let handle = MatcherHandle::new(matcher());
        let snapshot_before = handle.load();
        assert_eq!(
            snapshot_before.find(&Destination::new("example.com", 80, Proto::Tcp)),
            ForwardDecision::Direct
        );

        let mut hosts = HostsTable::new(false);
        hosts.insert(
            "example.com",
            HostsEntry {
                v4: vec!["1.2.3.4".parse().unwrap()],
                v6: vec![],
                redirect: false,
                group: "default".to_string(),
            },
        );
        let blacklist = BlacklistMatcher::new(HashSet::new(), vec![], vec![], "socks5://x:1");
        handle.publish(Matcher::new(hosts, blacklist));

        // The snapshot captured before the publish is untouched.
        assert_eq!(
            snapshot_before.find(&Destination::new("example.com", 80, Proto::Tcp)),
            ForwardDecision::Direct
        );
        // A fresh load sees the new snapshot.
        assert!(matches!(
            handle.load().find(&Destination::new("example.com", 80, Proto::Tcp)),
            ForwardDecision::HostsOverride { .. }
        ));
    }
}
