//! Smart HTTP application (§4.7): same matcher, same three branches as the
//! smart SOCKS session, layered over the base HTTP listener. Grounded on
//! `examples/original_source/gsocks/smart_relay.py`'s HTTP counterpart and
//! `hosts.py`'s `need_redirect`.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, LOCATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use firefly_core::wire::{Addr, Cmd, Rep, Request as SocksRequest};
use firefly_core::{CoreError, Destination, ForwardDecision, Proto, Result as CoreResult};
use firefly_matcher::Matcher;
use firefly_net::pipe_tcp;
use firefly_socks::codec_io::{basic_handshake_client, read_reply, send_request};

use crate::error::{HttpProxyError, Result};
use crate::listener::{
    absolute_uri, empty_body, error_response, handle_connect, sanitize_request_headers,
    target_from_request, to_origin_form, ProxyClient, CONNECT_IDLE_TIMEOUT, FORWARD_TIMEOUT,
};
use crate::raw_http::forward_over_stream;

fn parse_channel_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("socks5://")
        .ok_or_else(|| HttpProxyError::InvalidTarget(format!("unsupported channel scheme in {url}")))?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| HttpProxyError::InvalidTarget(format!("missing port in channel url {url}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| HttpProxyError::InvalidTarget(format!("invalid port in channel url {url}")))?;
    Ok((host.to_string(), port))
}

async fn dial_channel_connect(
    channel_host: &str,
    channel_port: u16,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    let mut downstream = TcpStream::connect((channel_host, channel_port)).await?;
    if !basic_handshake_client(&mut downstream)
        .await
        .map_err(HttpProxyError::Core)?
    {
        return Err(HttpProxyError::InvalidTarget(
            "channel rejected handshake".to_string(),
        ));
    }
    let addr = match target_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Addr::V4(v4.octets()),
        Ok(IpAddr::V6(v6)) => Addr::V6(v6.octets()),
        Err(_) => Addr::Domain(target_host.to_string()),
    };
    let request = SocksRequest {
        cmd: Cmd::Connect,
        addr,
        port: target_port,
    };
    send_request(&mut downstream, &request)
        .await
        .map_err(HttpProxyError::Core)?;
    let reply = read_reply(&mut downstream).await.map_err(HttpProxyError::Core)?;
    if reply.rep != Rep::Succeeded {
        return Err(HttpProxyError::Core(CoreError::AddressUnreachable(
            target_host.to_string(),
        )));
    }
    Ok(downstream)
}

fn redirect_to_https<B>(req: &Request<B>, host: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let location = format!("https://{host}{path}");
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .header(CONNECTION, "close")
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

async fn handle_connect_override(
    mut req: Request<Incoming>,
    ip: IpAddr,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => match TcpStream::connect(SocketAddr::new(ip, port)).await {
                Ok(mut remote) => {
                    let mut client_io = TokioIo::new(upgraded);
                    let _ = pipe_tcp(
                        &mut client_io,
                        &mut remote,
                        CONNECT_IDLE_TIMEOUT,
                        CONNECT_IDLE_TIMEOUT,
                    )
                    .await;
                }
                Err(e) => tracing::warn!(%ip, port, error = %e, "override connect dial failed"),
            },
            Err(e) => tracing::warn!(error = %e, "connect upgrade failed"),
        }
    });
    Ok(Response::new(empty_body()))
}

async fn handle_connect_channel(
    mut req: Request<Incoming>,
    url: String,
    host: String,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let (channel_host, channel_port) = parse_channel_url(&url)?;
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                match dial_channel_connect(&channel_host, channel_port, &host, port).await {
                    Ok(mut downstream) => {
                        let mut client_io = TokioIo::new(upgraded);
                        let _ = pipe_tcp(
                            &mut client_io,
                            &mut downstream,
                            CONNECT_IDLE_TIMEOUT,
                            CONNECT_IDLE_TIMEOUT,
                        )
                        .await;
                    }
                    Err(e) => tracing::warn!(error = %e, "channel connect dial failed"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "connect upgrade failed"),
        }
    });
    Ok(Response::new(empty_body()))
}

async fn forward_via_client(
    req: Request<Incoming>,
    client: &ProxyClient,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let resp = tokio::time::timeout(FORWARD_TIMEOUT, client.request(req))
        .await
        .map_err(|_| HttpProxyError::Timeout)?
        .map_err(|e| HttpProxyError::InvalidTarget(e.to_string()))?;
    Ok(resp.map(|b| b.boxed()))
}

async fn forward_via_channel(
    req: Request<Incoming>,
    url: &str,
    host: &str,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let (channel_host, channel_port) = parse_channel_url(url)?;
    let (parts, body) = req.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(HttpProxyError::Hyper)?
        .to_bytes();
    let mut downstream = dial_channel_connect(&channel_host, channel_port, host, port).await?;
    forward_over_stream(&mut downstream, &parts.method, &parts.uri, &parts.headers, body_bytes).await
}

async fn dispatch_smart(
    mut req: Request<Incoming>,
    client_addr: IpAddr,
    matcher: Arc<Matcher>,
    client: ProxyClient,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let (host, port) = target_from_request(&req)?;
    let method = req.method().clone();
    let destination = Destination::new(host.clone(), port, Proto::Tcp);
    let decision = matcher.find(&destination);

    if method == Method::CONNECT {
        return match decision {
            ForwardDecision::Direct => handle_connect(req).await,
            ForwardDecision::HostsOverride { addrs } => {
                let ip = *addrs
                    .first()
                    .ok_or_else(|| HttpProxyError::InvalidTarget("empty hosts override".to_string()))?;
                handle_connect_override(req, ip, port).await
            }
            ForwardDecision::Channel { url } => handle_connect_channel(req, url, host, port).await,
        };
    }

    if matches!(decision, ForwardDecision::HostsOverride { .. })
        && matcher.need_redirect(method.as_str(), &host)
    {
        return Ok(redirect_to_https(&req, &host));
    }

    sanitize_request_headers(&mut req, client_addr);

    match decision {
        ForwardDecision::Direct => {
            *req.uri_mut() = absolute_uri(&req, &host, port)?;
            forward_via_client(req, &client).await
        }
        ForwardDecision::HostsOverride { addrs } => {
            let ip = addrs
                .first()
                .ok_or_else(|| HttpProxyError::InvalidTarget("empty hosts override".to_string()))?;
            *req.uri_mut() = absolute_uri(&req, &ip.to_string(), port)?;
            forward_via_client(req, &client).await
        }
        ForwardDecision::Channel { url } => forward_via_channel(req, &url, &host, port).await,
    }
}

async fn handle_smart(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    matcher: Arc<Matcher>,
    client: ProxyClient,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let result = dispatch_smart(req, client_addr.ip(), matcher, client).await;
    Ok(result.unwrap_or_else(|e| error_response(&e)))
}

/// The matcher-aware HTTP proxy listener.
pub struct SmartHttpServer {
    listen_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl SmartHttpServer {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            handle: None,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub async fn start(&mut self, matcher: Arc<Matcher>) -> CoreResult<SocketAddr> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let bound = listener.local_addr()?;
        self.listen_addr = bound;

        let client: ProxyClient = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let matcher = matcher.clone();
                        let client = client.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                handle_smart(req, peer, matcher.clone(), client.clone())
                            });
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                tracing::debug!(error = %e, "smart http connection closed with error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "smart http accept failed"),
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

impl Drop for SmartHttpServer {
    fn drop(&mut self) {
        self.stop();
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
    fn test_redirect_location_uses_https_scheme() {
        let req: Request<()> = Request::builder().uri("/bar").body(()).unwrap();
        let resp = redirect_to_https(&req, "foo.test");
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(LOCATION).unwrap(),
            "https://foo.test/bar"
        );
    }
}
