//! SOCKS5 relay core (§4.3): handshake, command dispatch, direct TCP/UDP
//! relay sessions. Grounded on `relay.py`'s `RelaySession`/`SocksSession`.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use firefly_core::wire::{Addr, Cmd, Rep, Request};
use firefly_core::{CoreError, Result};
use firefly_net::{bind_connected_udp, bind_local_udp, pipe_tcp, pipe_udp};

use crate::codec_io::{basic_handshake_server, read_request, reply_failure, reply_success};

pub(crate) fn socket_addr_to_wire(addr: SocketAddr) -> Addr {
    match addr.ip() {
        IpAddr::V4(v4) => Addr::V4(v4.octets()),
        IpAddr::V6(v6) => Addr::V6(v6.octets()),
    }
}

fn request_target(request: &Request) -> Result<String> {
    match &request.addr {
        Addr::V4(b) => Ok(IpAddr::from(*b).to_string()),
        Addr::V6(b) => Ok(IpAddr::from(*b).to_string()),
        Addr::Domain(name) => Ok(name.clone()),
    }
}

/// Connect directly to `host:port` (resolving DNS names), reply to the
/// client with the bound local address, then pipe bytes until either side
/// closes or idles past `timeout`.
pub async fn relay_connect_direct(
    mut client: TcpStream,
    host: &str,
    port: u16,
    request: &Request,
    timeout: Duration,
) -> Result<()> {
    let remote = match dial(host, port).await {
        Ok(remote) => remote,
        Err(_) => {
            reply_failure(&mut client, Rep::HostUnreachable, request.addr.clone(), request.port)
                .await?;
            return Ok(());
        }
    };
    relay_connected(client, remote, timeout).await
}

/// As `relay_connect_direct`, but tries each of `addrs` in order (the
/// hosts-override branch, §3 "HostsOverride is tried in order").
pub async fn relay_connect_addrs(
    mut client: TcpStream,
    addrs: &[IpAddr],
    port: u16,
    request: &Request,
    timeout: Duration,
) -> Result<()> {
    for ip in addrs {
        if let Ok(remote) = TcpStream::connect(SocketAddr::new(*ip, port)).await {
            return relay_connected(client, remote, timeout).await;
        }
    }
    reply_failure(&mut client, Rep::HostUnreachable, request.addr.clone(), request.port).await?;
    Ok(())
}

async fn relay_connected(mut client: TcpStream, mut remote: TcpStream, timeout: Duration) -> Result<()> {
    let bound = remote.local_addr()?;
    reply_success(&mut client, socket_addr_to_wire(bound), bound.port()).await?;
    pipe_tcp(&mut client, &mut remote, timeout, timeout).await
}

async fn dial(host: &str, port: u16) -> std::io::Result<TcpStream> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        TcpStream::connect(SocketAddr::new(ip, port)).await
    } else {
        TcpStream::connect((host, port)).await
    }
}

/// Bind `clientUDP`, reply with its address, wait for the first valid
/// datagram, derive the destination from it, bind `remoteUDP`, forward the
/// first payload, then pump (§4.3 UDP_ASSOCIATE; §3 invariants on
/// `clientAssociate` and `frag != 0`).
pub async fn relay_udp_associate_direct(
    mut client: TcpStream,
    request: &Request,
    timeout: Duration,
) -> Result<()> {
    let client_udp = bind_local_udp(&client).await?;
    let bound = client_udp.local_addr()?;
    reply_success(&mut client, socket_addr_to_wire(bound), bound.port()).await?;

    let client_associate = socket_addr_from_request(request);

    let (first_data, first_client_addr, first_dest) =
        match wait_for_first_datagram(&client, &client_udp, client_associate, timeout).await? {
            Some(v) => v,
            None => return Ok(()),
        };

    let remote_udp = bind_connected_udp(first_dest).await?;
    remote_udp.send(&first_data).await?;

    pipe_udp(
        Some(&client),
        &client_udp,
        &remote_udp,
        timeout,
        timeout,
        Some(first_client_addr),
        |from| addr_allowed(client_associate, from),
        |bytes| {
            let dg = firefly_core::wire::UdpDatagram::unpack(bytes).ok()?;
            if !dg.is_unfragmented() {
                tracing::warn!("dropping fragmented udp datagram");
                return None;
            }
            Some(dg.payload)
        },
        |bytes| {
            let dg = firefly_core::wire::UdpDatagram {
                frag: 0,
                addr: socket_addr_to_wire(first_dest),
                port: first_dest.port(),
                payload: bytes.to_vec(),
            };
            Some(dg.pack())
        },
    )
    .await
}

pub(crate) fn socket_addr_from_request(request: &Request) -> SocketAddr {
    match &request.addr {
        Addr::V4(b) => SocketAddr::new(IpAddr::from(*b), request.port),
        Addr::V6(b) => SocketAddr::new(IpAddr::from(*b), request.port),
        Addr::Domain(_) => SocketAddr::new(IpAddr::from([0, 0, 0, 0]), request.port),
    }
}

/// `clientAssociate.ip` of `0.0.0.0`/`::` means "accept from anywhere";
/// otherwise the source must match exactly (§3 invariant).
pub(crate) fn addr_allowed(client_associate: SocketAddr, from: SocketAddr) -> bool {
    let wildcard = client_associate.ip().is_unspecified();
    wildcard || from == client_associate
}

pub(crate) async fn wait_for_first_datagram(
    watch: &TcpStream,
    client_udp: &UdpSocket,
    client_associate: SocketAddr,
    timeout: Duration,
) -> Result<Option<(Vec<u8>, SocketAddr, SocketAddr)>> {
    let mut buf = [0u8; 65536];
    loop {
        tokio::select! {
            _ = watch.readable() => {
                return Ok(None);
            }
            res = tokio::time::timeout(timeout, client_udp.recv_from(&mut buf)) => {
                let (n, from) = res.map_err(|_| CoreError::Timeout)??;
                if !addr_allowed(client_associate, from) {
                    tracing::warn!(%from, "dropping first udp datagram from unassociated address");
                    continue;
                }
                let dg = match firefly_core::wire::UdpDatagram::unpack(&buf[..n]) {
                    Ok(dg) => dg,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed udp datagram");
                        continue;
                    }
                };
                if !dg.is_unfragmented() {
                    tracing::warn!("dropping fragmented udp datagram");
                    continue;
                }
                let dest = match &dg.addr {
                    Addr::V4(b) => SocketAddr::new(IpAddr::from(*b), dg.port),
                    Addr::V6(b) => SocketAddr::new(IpAddr::from(*b), dg.port),
                    Addr::Domain(name) => {
                        match tokio::net::lookup_host((name.as_str(), dg.port)).await?.next() {
                            Some(addr) => addr,
                            None => {
                                tracing::warn!(%name, "could not resolve udp destination");
                                continue;
                            }
                        }
                    }
                };
                return Ok(Some((dg.payload, from, dest)));
            }
        }
    }
}

/// Handle one accepted SOCKS5 connection with the base (non-matcher-aware)
/// relay behavior: CONNECT dials directly, UDP_ASSOCIATE relays directly,
/// BIND is not supported.
pub async fn serve_direct(mut client: TcpStream, session_timeout: Duration) -> Result<()> {
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
            let host = request_target(&request)?;
            relay_connect_direct(client, &host, request.port, &request, session_timeout).await
        }
        Cmd::UdpAssociate => relay_udp_associate_direct(client, &request, session_timeout).await,
        Cmd::Bind => {
            reply_failure(&mut client, Rep::CommandNotSupported, request.addr.clone(), request.port)
                .await
        }
    }
}

/// A listening SOCKS5 server running an arbitrary per-connection handler.
/// Grounded on the teacher's `Socks5Server` shape (`listen_addr`, `start`,
/// `stop`, `Drop`).
pub struct SocksServer {
    listen_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl SocksServer {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            handle: None,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Starts accepting connections, dispatching each to `handler`. Returns
    /// the address actually bound (useful when `listen_addr`'s port is 0).
    pub async fn start<F, Fut>(&mut self, handler: F) -> Result<SocketAddr>
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let bound = listener.local_addr()?;
        self.listen_addr = bound;

        let handler = std::sync::Arc::new(handler);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted socks connection");
                        let handler = handler.clone();
                        tokio::spawn(async move { handler(stream).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "socks accept failed");
                    }
                }
            }
        });
        self.handle = Some(task);
        Ok(bound)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for SocksServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec_io::{basic_handshake_client, read_reply, send_request};
    use firefly_core::wire::InitRequest;

    #[tokio::test]
    async fn test_socks_server_creation_and_stop() {
        let mut server = SocksServer::new("127.0.0.1:0".parse().unwrap());
        let bound = server.start(|_stream| async {}).await.unwrap();
        assert_eq!(bound.ip().to_string(), "127.0.0.1");
        server.stop();
    }

    #[tokio::test]
    async fn test_direct_connect_roundtrip() {
        // A tiny echo server to CONNECT to.
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut server = SocksServer::new("127.0.0.1:0".parse().unwrap());
        let bound = server
            .start(|stream| async move {
                let _ = serve_direct(stream, Duration::from_secs(5)).await;
            })
            .await
            .unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        assert!(basic_handshake_client(&mut client).await.unwrap());

        let req = Request {
            cmd: Cmd::Connect,
            addr: match echo_addr.ip() {
                IpAddr::V4(v4) => Addr::V4(v4.octets()),
                IpAddr::V6(v6) => Addr::V6(v6.octets()),
            },
            port: echo_addr.port(),
        };
        send_request(&mut client, &req).await.unwrap();
        let reply = read_reply(&mut client).await.unwrap();
        assert_eq!(reply.rep, Rep::Succeeded);

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_init_request_helper_unused_import_sanity() {
        // keep InitRequest import exercised across the test module
        let _ = InitRequest::new_no_auth();
    }
}
