//! Per-front-URL LIFO pool of HTTP clients (§4.8 "HTTP client pool", §5
//! "Shared resources: HTTP client pool").
//!
//! Grounded on `examples/original_source/meeksocks/relay.py`'s
//! `HTTPClientPool` (pool keyed by fronturl, `get`/`give_back`) and, for the
//! `HashMap`-of-`Vec` shape and non-blocking `get`/`release` contract, this
//! codebase's `crates/relay/src/cache.rs` (`RequestCache`).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// `get` is non-blocking: it pops a warm client for this fronturl or builds
/// a fresh one. `release` is a non-blocking push back; `discard` just drops.
pub struct HttpClientPool {
    idle: Mutex<HashMap<String, Vec<reqwest::Client>>>,
}

impl HttpClientPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Pops the most-recently-released client for `fronturl`, or builds one
    /// with the given TLS verification setting and connect/network timeout.
    pub fn get(&self, fronturl: &str, verify: bool, timeout: Duration) -> reqwest::Client {
        if let Some(client) = self
            .idle
            .lock()
            .get_mut(fronturl)
            .and_then(|stack| stack.pop())
        {
            return client;
        }
        build_client(verify, timeout)
    }

    /// Returns a client to the pool after clean session termination.
    pub fn release(&self, fronturl: &str, client: reqwest::Client) {
        self.idle
            .lock()
            .entry(fronturl.to_string())
            .or_default()
            .push(client);
    }

    /// Drops `client` instead of pooling it, used after an error shutdown.
    pub fn discard(&self, _client: reqwest::Client) {}

    pub fn idle_count(&self, fronturl: &str) -> usize {
        self.idle
            .lock()
            .get(fronturl)
            .map(|stack| stack.len())
            .unwrap_or(0)
    }
}

impl Default for HttpClientPool {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client(verify: bool, timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!verify)
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
