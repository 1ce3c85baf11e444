//! Meek front-end relay pool: candidate description, connectivity probing,
//! and selection.
//!
//! Grounded on `examples/original_source/meeksocks/relay.py`'s
//! `MeekRelayFactory.select_relay` and `examples/original_source/component/
//! circumvention.py`'s `MeekChannel._valid_relays`. The latter appends every
//! probed candidate to the result twice — once from the probe's own success
//! branch, once unconditionally after `spawn` returns — so a relay that
//! fails the probe still ends up selectable. This implementation appends a
//! candidate exactly once, only when its probe succeeds (§9 open question).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::constants::CLIENT_MAX_FAILURE;

/// A relay as configured (settings/static list), before connectivity has
/// been established.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub fronturl: String,
    pub hostname: String,
    pub verify: bool,
    pub stream: bool,
}

/// A relay known to be reachable, tracked with a live failure counter.
#[derive(Debug)]
pub struct Relay {
    pub fronturl: String,
    pub hostname: String,
    pub verify: bool,
    pub stream: bool,
    failure: AtomicU32,
}

impl Relay {
    fn from_config(cfg: RelayConfig) -> Self {
        Self {
            fronturl: cfg.fronturl,
            hostname: cfg.hostname,
            verify: cfg.verify,
            stream: cfg.stream,
            failure: AtomicU32::new(0),
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_retired(&self) -> bool {
        self.failure_count() >= CLIENT_MAX_FAILURE
    }
}

/// The live relay pool. Mutated only by whoever owns the meek channel;
/// readers take a snapshot (a plain borrow of the `Vec`) when selecting (§5
/// "Shared resources").
pub struct RelayTable {
    relays: Vec<Arc<Relay>>,
}

impl RelayTable {
    pub fn new(relays: Vec<Relay>) -> Self {
        Self {
            relays: relays.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Uniform random choice among relays below the failure threshold.
    /// Returns `None` if every relay has been retired.
    pub fn select(&self) -> Option<Arc<Relay>> {
        let candidates: Vec<&Arc<Relay>> = self.relays.iter().filter(|r| !r.is_retired()).collect();
        candidates.choose(&mut rand::thread_rng()).map(|r| Arc::clone(r))
    }
}

/// Probes one candidate's reachability: a bare TCP connect to the fronturl's
/// host:port. Connectivity, not full TLS/application validation, is all
/// `_valid_relays` actually checks in the original before admitting a relay.
pub async fn probe_relay(candidate: &RelayConfig, timeout: Duration) -> bool {
    let parsed = match url::Url::parse(&candidate.fronturl) {
        Ok(u) => u,
        Err(_) => return false,
    };
    let host = match parsed.host_str() {
        Some(h) => h.to_string(),
        None => return false,
    };
    let port = parsed
        .port_or_known_default()
        .unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });

    tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Probes every candidate concurrently and builds a `RelayTable` containing
/// exactly the ones that passed — the double-append bug fix.
pub async fn build_relay_table(candidates: Vec<RelayConfig>, probe_timeout: Duration) -> RelayTable {
    let mut tasks = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        tasks.push(tokio::spawn(async move {
            let ok = probe_relay(&candidate, probe_timeout).await;
            (candidate, ok)
        }));
    }

    let mut relays = Vec::new();
    for task in tasks {
        if let Ok((candidate, true)) = task.await {
            relays.push(Relay::from_config(candidate));
        }
    }
    RelayTable::new(relays)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(fronturl: &str) -> RelayConfig {
        RelayConfig {
            fronturl: fronturl.to_string(),
            hostname: "meek.example".to_string(),
            verify: true,
            stream: true,
        }
    }

    #[test]
    fn test_relay_retires_at_max_failure() {
        let relay = Relay::from_config(cfg("https://cdn.example/"));
        for _ in 0..CLIENT_MAX_FAILURE {
            assert!(!relay.is_retired());
            relay.record_failure();
        }
        assert!(relay.is_retired());
    }

    #[test]
    fn test_select_skips_retired_relays() {
        let good = Relay::from_config(cfg("https://good.example/"));
        let bad = Relay::from_config(cfg("https://bad.example/"));
        for _ in 0..CLIENT_MAX_FAILURE {
            bad.record_failure();
        }
        let table = RelayTable::new(vec![good, bad]);
        let picked = table.select().expect("one relay still eligible");
        assert_eq!(picked.fronturl, "https://good.example/");
    }

    #[test]
    fn test_select_returns_none_when_all_retired() {
        let only = Relay::from_config(cfg("https://only.example/"));
        for _ in 0..CLIENT_MAX_FAILURE {
            only.record_failure();
        }
        let table = RelayTable::new(vec![only]);
        assert!(table.select().is_none());
    }

    #[tokio::test]
    async fn test_build_relay_table_drops_unreachable_candidates() {
        // Port 0 connect never succeeds in time; this candidate must be excluded,
        // and must not appear twice even though circumvention.py's bug would have.
        let candidates = vec![cfg("http://127.0.0.1:0/")];
        let table = build_relay_table(candidates, Duration::from_millis(50)).await;
        assert_eq!(table.len(), 0);
    }
}
