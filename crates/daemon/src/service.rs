//! Owns listener lifecycles (SOCKS5, HTTP, optional meek) and the live
//! matcher snapshot, and answers [`ControlRequest`]s against them (§6, §9
//! "Mutable shared matcher").

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use firefly_httpproxy::SmartHttpServer;
use firefly_matcher::{BlacklistMatcher, HostsTable, Matcher, MatcherHandle};
use firefly_meek::{build_relay_table, HttpClientPool, MeekServerHandle, RelayConfig};
use firefly_settings::Settings;
use firefly_socks::{serve_smart, ForwarderTable, SocksServer};

use crate::control::{ControlRequest, ControlResponse};
use crate::error::{DaemonError, Result};

/// The meek client's own accept loop: every accepted connection runs
/// [`firefly_meek::run_session`] against the configured relay pool (§4.8
/// "Session startup"). There is no per-connection handle to track; aborting
/// this task drops the listener and detaches in-flight sessions.
struct MeekClientListener {
    listen_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Drop for MeekClientListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Mirrors `detect_ipv6` (`hosts.py`): resolve a well-known dual-stack host
/// and trust the resolver's address-family preference as a proxy for
/// whether this machine has working IPv6 connectivity.
async fn probe_ipv6() -> bool {
    match tokio::net::lookup_host("www.google.com:80").await {
        Ok(mut addrs) => addrs.next().map(|a| a.is_ipv6()).unwrap_or(false),
        Err(e) => {
            warn!(error = %e, "ipv6 probe failed, assuming no ipv6");
            false
        }
    }
}

/// Builds a fresh [`Matcher`] snapshot from `settings`, re-probing IPv6 and
/// re-reading the hosts/blacklist files from disk. Called once at startup
/// and again on every `ReloadMatcher` request.
pub async fn build_matcher(settings: &Settings) -> Matcher {
    let has_ipv6 = probe_ipv6().await;

    let hosts = match &settings.matcher.hosts_path {
        Some(path) => firefly_settings::load_hosts_table(path, has_ipv6).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "failed to load hosts table, using empty table");
            HostsTable::new(has_ipv6)
        }),
        None => HostsTable::new(has_ipv6),
    };

    let blacklist_set = match &settings.matcher.blacklist_path {
        Some(path) => firefly_settings::load_blacklist_set(path).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "failed to load blacklist, using empty set");
            Default::default()
        }),
        None => Default::default(),
    };

    let blacklist = BlacklistMatcher::new(
        blacklist_set,
        settings.matcher.custom_blacklist.clone(),
        settings.matcher.custom_whitelist.clone(),
        settings.matcher.channel_url.clone(),
    );

    Matcher::new(hosts, blacklist)
}

/// The daemon's process-wide state: configuration, the live matcher
/// snapshot, and whichever listeners are currently running.
pub struct DaemonService {
    settings: Settings,
    matcher_handle: Arc<MatcherHandle>,
    socks_server: Option<SocksServer>,
    http_server: Option<SmartHttpServer>,
    meek_handle: Option<MeekServerHandle>,
    meek_client_listener: Option<MeekClientListener>,
    shutdown_notify: Arc<tokio::sync::Notify>,
}

impl DaemonService {
    pub async fn new(settings: Settings) -> Self {
        let matcher = build_matcher(&settings).await;
        Self {
            settings,
            matcher_handle: Arc::new(MatcherHandle::new(matcher)),
            socks_server: None,
            http_server: None,
            meek_handle: None,
            meek_client_listener: None,
            shutdown_notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn matcher_handle(&self) -> Arc<MatcherHandle> {
        self.matcher_handle.clone()
    }

    /// Fires once a `Shutdown` control request has been handled, so the
    /// process driving this service (see `lib::run`) can unwind.
    pub fn shutdown_notify(&self) -> Arc<tokio::sync::Notify> {
        self.shutdown_notify.clone()
    }

    /// Starts every listener named in `settings.listeners`. The SOCKS5
    /// listener is mandatory; HTTP and meek are only started when their
    /// addresses are configured.
    pub async fn start(&mut self) -> Result<()> {
        let socks_addr = parse_addr(&self.settings.listeners.socks5_addr)?;
        let mut socks_server = SocksServer::new(socks_addr);
        let matcher_handle = self.matcher_handle.clone();
        let session_timeout = Duration::from_secs(self.settings.timeouts.session_idle_secs);

        let bound = socks_server
            .start(move |client| {
                let matcher_handle = matcher_handle.clone();
                async move {
                    let matcher = matcher_handle.load();
                    let forwarders = ForwarderTable::with_default_socks5();
                    if let Err(e) = serve_smart(client, matcher, forwarders, session_timeout).await
                    {
                        tracing::debug!(error = %e, "socks session ended with error");
                    }
                }
            })
            .await?;
        info!(%bound, "socks5 listener started");
        self.socks_server = Some(socks_server);

        if let Some(http_addr) = self.settings.listeners.http_addr.clone() {
            let addr = parse_addr(&http_addr)?;
            let mut http_server = SmartHttpServer::new(addr);
            let bound = http_server.start(self.matcher_handle.load()).await?;
            info!(%bound, "http listener started");
            self.http_server = Some(http_server);
        }

        if let Some(meek_addr) = self.settings.listeners.meek_server_addr.clone() {
            let addr = parse_addr(&meek_addr)?;
            let mut meek_handle = MeekServerHandle::new(addr);
            let bound = meek_handle.start(socks_addr).await?;
            info!(%bound, "meek server listener started");
            self.meek_handle = Some(meek_handle);
        }

        if let Some(meek_client_addr) = self.settings.listeners.meek_client_addr.clone() {
            let addr = parse_addr(&meek_client_addr)?;
            let candidates: Vec<RelayConfig> = self
                .settings
                .meek
                .relays
                .iter()
                .map(|r| RelayConfig {
                    fronturl: r.fronturl.clone(),
                    hostname: r.hostname.clone(),
                    verify: r.verify,
                    stream: r.stream,
                })
                .collect();
            let probe_timeout = Duration::from_secs(self.settings.meek.probe_timeout_secs);
            let relay_table = Arc::new(build_relay_table(candidates, probe_timeout).await);
            if relay_table.is_empty() {
                warn!("meek client listener configured but no relay passed the connectivity probe");
            }
            let pool = Arc::new(HttpClientPool::new());

            let listener = TcpListener::bind(addr).await?;
            let bound = listener.local_addr()?;
            let handle = tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "accepted meek client connection");
                            let relay_table = relay_table.clone();
                            let pool = pool.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    firefly_meek::run_session(stream, relay_table, pool, session_timeout)
                                        .await
                                {
                                    tracing::debug!(error = %e, "meek client session ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "meek client accept failed");
                        }
                    }
                }
            });
            info!(%bound, "meek client listener started");
            self.meek_client_listener = Some(MeekClientListener {
                listen_addr: bound,
                handle,
            });
        }

        Ok(())
    }

    /// Aborts every running listener's accept loop. Already-spawned
    /// connection tasks are detached and run to completion undisturbed.
    pub fn stop(&mut self) {
        if let Some(s) = self.socks_server.as_mut() {
            s.stop();
        }
        if let Some(s) = self.http_server.as_mut() {
            s.stop();
        }
        if let Some(m) = self.meek_handle.as_mut() {
            m.stop();
        }
        self.meek_client_listener = None;
    }

    pub async fn handle_request(&mut self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Status => ControlResponse::Status {
                socks5_addr: self.socks_server.as_ref().map(|s| s.listen_addr().to_string()),
                http_addr: self.http_server.as_ref().map(|s| s.listen_addr().to_string()),
                meek_addr: self.meek_handle.as_ref().map(|h| h.listen_addr().to_string()),
                meek_client_addr: self
                    .meek_client_listener
                    .as_ref()
                    .map(|l| l.listen_addr.to_string()),
                hosts_path: self.settings.matcher.hosts_path.clone(),
                blacklist_path: self.settings.matcher.blacklist_path.clone(),
            },
            ControlRequest::ReloadMatcher { path } => match self.reload_matcher(path).await {
                Ok(()) => ControlResponse::MatcherReloaded,
                Err(e) => ControlResponse::Error {
                    message: e.to_string(),
                },
            },
            ControlRequest::Shutdown => {
                self.stop();
                self.shutdown_notify.notify_waiters();
                ControlResponse::ShuttingDown
            }
        }
    }

    /// Publishes a fresh matcher snapshot (§9 "Mutable shared matcher"):
    /// in-flight SOCKS5/HTTP sessions keep the snapshot they captured at
    /// connection time, new sessions see the reloaded one. The HTTP
    /// listener bakes its snapshot into the accept loop rather than
    /// reloading per-connection, so it is restarted to pick up the change;
    /// its in-flight requests are unaffected since `stop()` only aborts the
    /// accept loop.
    async fn reload_matcher(&mut self, path: Option<PathBuf>) -> Result<()> {
        if let Some(path) = path {
            self.settings.matcher.hosts_path = Some(path);
        }
        let matcher = build_matcher(&self.settings).await;
        self.matcher_handle.publish(matcher);

        if let Some(mut old) = self.http_server.take() {
            if let Some(http_addr) = self.settings.listeners.http_addr.clone() {
                old.stop();
                let addr = parse_addr(&http_addr)?;
                let mut http_server = SmartHttpServer::new(addr);
                http_server.start(self.matcher_handle.load()).await?;
                self.http_server = Some(http_server);
            } else {
                old.stop();
            }
        }

        Ok(())
    }
}

fn parse_addr(raw: &str) -> Result<SocketAddr> {
    raw.parse()
        .map_err(|_| DaemonError::Control(format!("invalid listener address: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use firefly_settings::Settings;

    #[tokio::test]
    async fn test_build_matcher_with_no_files_is_empty() {
        let settings = Settings::default();
        let matcher = build_matcher(&settings).await;
        let dest = firefly_core::Destination::new("example.com", 443, firefly_core::Proto::Tcp);
        assert_eq!(matcher.find(&dest), firefly_core::ForwardDecision::Direct);
    }

    #[tokio::test]
    async fn test_service_start_binds_socks_listener() {
        let mut settings = Settings::default();
        settings.listeners.socks5_addr = "127.0.0.1:0".to_string();
        let mut service = DaemonService::new(settings).await;
        service.start().await.unwrap();
        match service.handle_request(ControlRequest::Status).await {
            ControlResponse::Status { socks5_addr, .. } => assert!(socks5_addr.is_some()),
            other => panic!("unexpected response: {other:?}"),
        }
        service.stop();
    }

    #[tokio::test]
    async fn test_shutdown_request_stops_listeners() {
        let mut settings = Settings::default();
        settings.listeners.socks5_addr = "127.0.0.1:0".to_string();
        let mut service = DaemonService::new(settings).await;
        service.start().await.unwrap();
        let response = service.handle_request(ControlRequest::Shutdown).await;
        assert!(matches!(response, ControlResponse::ShuttingDown));
    }
}
