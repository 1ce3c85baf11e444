//! Smart SOCKS session (§4.6): consults the matcher, then dispatches to
//! direct, hosts-override, or downstream-channel relaying. Grounded on
//! `smart_relay.py`'s `SmartRelaySession` (`cmd_connect`, `cmd_udp_associate`,
//! `smart_socks_tcp`, `smart_socks_udp`).

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use firefly_core::wire::{Addr, Cmd, Rep, Request};
use firefly_core::{CoreError, Destination, ForwardDecision, Proto, Result};
use firefly_matcher::Matcher;

use crate::codec_io::{
    basic_handshake_client, basic_handshake_server, read_reply, read_request, reply_failure,
    reply_success, send_request,
};
use crate::relay::{relay_connect_addrs, relay_connect_direct};

type ForwardFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type ForwardFn = Arc<dyn Fn(TcpStream, Request, String) -> ForwardFuture + Send + Sync>;

/// `registerForwarder(scheme, proto, fn)`: extends the session with new
/// channel schemes without touching the dispatch core.
#[derive(Clone)]
pub struct ForwarderTable {
    forwarders: HashMap<(String, String), ForwardFn>,
}

impl ForwarderTable {
    pub fn with_default_socks5() -> Self {
        let mut forwarders: HashMap<(String, String), ForwardFn> = HashMap::new();
        forwarders.insert(
            ("socks5".to_string(), "tcp".to_string()),
            Arc::new(|client, request, url| Box::pin(forward_via_socks5_tcp(client, request, url))),
        );
        Self { forwarders }
    }

    pub fn register(&mut self, scheme: impl Into<String>, proto: impl Into<String>, f: ForwardFn) {
        self.forwarders.insert((scheme.into(), proto.into()), f);
    }

    fn get(&self, scheme: &str, proto: &str) -> Option<&ForwardFn> {
        self.forwarders.get(&(scheme.to_string(), proto.to_string()))
    }
}

/// Parses `socks5://host:port[/]` (§6 channel URL grammar).
fn parse_channel_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("socks5://")
        .ok_or_else(|| CoreError::Protocol(format!("unsupported channel scheme in {url}")))?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| CoreError::Protocol(format!("missing port in channel url {url}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| CoreError::Protocol(format!("invalid port in channel url {url}")))?;
    Ok((host.to_string(), port))
}

async fn forward_via_socks5_tcp(mut client: TcpStream, request: Request, url: String) -> Result<()> {
    let (host, port) = parse_channel_url(&url)?;
    let mut downstream = TcpStream::connect((host.as_str(), port)).await?;
    if !basic_handshake_client(&mut downstream).await? {
        reply_failure(&mut client, Rep::GeneralFailure, request.addr.clone(), request.port).await?;
        return Ok(());
    }
    send_request(&mut downstream, &request).await?;
    let reply = read_reply(&mut downstream).await?;
    if reply.rep != Rep::Succeeded {
        reply_failure(&mut client, reply.rep, request.addr.clone(), request.port).await?;
        return Ok(());
    }
    reply_success(&mut client, reply.addr, reply.port).await?;
    firefly_net::pipe_tcp(&mut client, &mut downstream, Duration::from_secs(60), Duration::from_secs(60)).await
}

fn request_host(request: &Request) -> String {
    match &request.addr {
        Addr::V4(b) => IpAddr::from(*b).to_string(),
        Addr::V6(b) => IpAddr::from(*b).to_string(),
        Addr::Domain(name) => name.clone(),
    }
}

/// Handle one accepted SOCKS5 connection with matcher-aware dispatch.
pub async fn serve_smart(
    mut client: TcpStream,
    matcher: Arc<Matcher>,
    forwarders: ForwarderTable,
    session_timeout: Duration,
) -> Result<()> {
    if !basic_handshake_server(&mut client).await? {
        return Ok(());
    }
    let request = match read_request(&mut client).await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "closing after malformed socks request");
            return Ok(());
        }
    };

    match request.cmd {
        Cmd::Connect => {
            let host = request_host(&request);
            let destination = Destination::new(host.clone(), request.port, Proto::Tcp);
            match matcher.find(&destination) {
                ForwardDecision::Direct => {
                    relay_connect_direct(client, &host, request.port, &request, session_timeout).await
                }
                ForwardDecision::HostsOverride { addrs } => {
                    relay_connect_addrs(client, &addrs, request.port, &request, session_timeout).await
                }
                ForwardDecision::Channel { url } => {
                    dispatch_channel_tcp(client, request, url, &forwarders).await
                }
            }
        }
        Cmd::UdpAssociate => {
            crate::udp::serve_smart_udp_associate(client, request, matcher, session_timeout).await
        }
        Cmd::Bind => {
            reply_failure(&mut client, Rep::CommandNotSupported, request.addr.clone(), request.port)
                .await
        }
    }
}

async fn dispatch_channel_tcp(
    mut client: TcpStream,
    request: Request,
    url: String,
    forwarders: &ForwarderTable,
) -> Result<()> {
    match forwarders.get("socks5", "tcp") {
        Some(f) => f(client, request, url).await,
        None => {
            reply_failure(&mut client, Rep::GeneralFailure, request.addr.clone(), request.port).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channel_url() {
        assert_eq!(
            parse_channel_url("socks5://127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
    }

    #[test]
    fn test_parse_channel_url_trailing_slash() {
        assert_eq!(
            parse_channel_url("socks5://relay.example:1080/").unwrap(),
            ("relay.example".to_string(), 1080)
        );
    }

    #[test]
    fn test_parse_channel_url_rejects_other_scheme() {
        assert!(parse_channel_url("http://127.0.0.1:9000").is_err());
    }

    #[test]
    fn test_forwarder_table_default_has_socks5_tcp() {
        let table = ForwarderTable::with_default_socks5();
        assert!(table.get("socks5", "tcp").is_some());
        assert!(table.get("socks5", "udp").is_none());
    }
}
