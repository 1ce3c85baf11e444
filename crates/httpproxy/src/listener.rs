//! Plain HTTP/1.1 forward proxy + CONNECT tunnel listener (§4.4). Grounded on
//! `ghttproxy/server.py`'s `get_destination`/`copy_request`/`set_forwarded_for`/
//! `reconstruct_url`/`pipe_socket`/`ProxyApplication.http`/`.tunnel`, reimplemented
//! on hyper's server/client split (the reverse-proxy idiom the pack's only
//! hyper-based stack, `fos-network`, follows for its own HTTP client).

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use firefly_core::Result as CoreResult;
use firefly_net::pipe_tcp;

use crate::error::{HttpProxyError, Result};

pub(crate) const CONNECT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a forwarded (non-CONNECT) request may take before its failure is
/// reported as `504 Gateway Timeout` rather than left to hang (§6).
pub(crate) const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) type ProxyClient = Client<HttpConnector, Incoming>;

pub(crate) fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Strips hop-by-hop headers (notably `Proxy-Connection`) and, unless the
/// client is loopback with no prior `X-Forwarded-For`, appends this hop's
/// address (§4.4 step 3).
pub(crate) fn sanitize_request_headers<B>(req: &mut Request<B>, client_addr: IpAddr) {
    let headers = req.headers_mut();
    headers.remove("proxy-connection");
    headers.remove(CONNECTION);

    let had_xff = headers.contains_key("x-forwarded-for");
    if !(client_addr.is_loopback() && !had_xff) {
        if let Ok(value) = HeaderValue::from_str(&client_addr.to_string()) {
            headers.append(HeaderName::from_static("x-forwarded-for"), value);
        }
    }
}

/// Extracts `host,port` from an absolute-form request-target or, failing
/// that, the `Host` header (§4.4 step 1-2).
pub(crate) fn target_from_request<B>(req: &Request<B>) -> Result<(String, u16)> {
    if let Some(authority) = req.uri().authority() {
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(80);
        return Ok((host, port));
    }
    let host_header = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or(HttpProxyError::MissingHost)?;
    match host_header.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse().unwrap_or(80))),
        None => Ok((host_header.to_string(), 80)),
    }
}

/// Strips scheme/authority, leaving only path-and-query (origin-form).
pub(crate) fn to_origin_form(uri: &Uri) -> Uri {
    let mut parts = uri.clone().into_parts();
    parts.scheme = None;
    parts.authority = None;
    Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
}

pub(crate) fn absolute_uri<B>(req: &Request<B>, host: &str, port: u16) -> Result<Uri> {
    let origin = to_origin_form(req.uri());
    format!("http://{host}:{port}{origin}")
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| HttpProxyError::InvalidTarget(e.to_string()))
}

/// Opens a CONNECT tunnel: replies `200`, then on upgrade dials `host:port`
/// and pipes bytes until either side closes (§4.4 CONNECT).
pub(crate) async fn handle_connect(
    mut req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let authority = req
        .uri()
        .authority()
        .cloned()
        .ok_or(HttpProxyError::MissingHost)?;
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let mut remote = match TcpStream::connect((host.as_str(), port)).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(%host, port, error = %e, "connect tunnel dial failed");
                        return;
                    }
                };
                let mut client_io = TokioIo::new(upgraded);
                if let Err(e) = pipe_tcp(
                    &mut client_io,
                    &mut remote,
                    CONNECT_IDLE_TIMEOUT,
                    CONNECT_IDLE_TIMEOUT,
                )
                .await
                {
                    tracing::debug!(error = %e, "connect tunnel closed with error");
                }
            }
            Err(e) => tracing::warn!(error = %e, "connect upgrade failed"),
        }
    });

    Ok(Response::new(empty_body()))
}

async fn handle_forward(
    mut req: Request<Incoming>,
    client_addr: IpAddr,
    client: ProxyClient,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let (host, port) = target_from_request(&req)?;
    sanitize_request_headers(&mut req, client_addr);
    *req.uri_mut() = absolute_uri(&req, &host, port)?;

    let resp = tokio::time::timeout(FORWARD_TIMEOUT, client.request(req))
        .await
        .map_err(|_| HttpProxyError::Timeout)?
        .map_err(|e| HttpProxyError::InvalidTarget(e.to_string()))?;
    Ok(resp.map(|b| b.boxed()))
}

pub(crate) fn error_response(err: &HttpProxyError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = match err {
        HttpProxyError::MissingHost | HttpProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
        HttpProxyError::Timeout | HttpProxyError::Core(firefly_core::CoreError::Timeout) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(error = %err, "http proxy request failed");
    Response::builder()
        .status(status)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

async fn handle(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    client: ProxyClient,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let result = if req.method() == Method::CONNECT {
        handle_connect(req).await
    } else {
        handle_forward(req, client_addr.ip(), client).await
    };
    Ok(result.unwrap_or_else(|e| error_response(&e)))
}

/// The base (non-matcher-aware) HTTP proxy listener.
pub struct HttpProxyServer {
    listen_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl HttpProxyServer {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            handle: None,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub async fn start(&mut self) -> CoreResult<SocketAddr> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let bound = listener.local_addr()?;
        self.listen_addr = bound;

        let client: ProxyClient = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let client = client.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| handle(req, peer, client.clone()));
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                tracing::debug!(error = %e, "http connection closed with error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "http proxy accept failed"),
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

impl Drop for HttpProxyServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_target_from_request_uses_authority() {
        let req = Request::builder()
            .uri("http://example.com:8080/path")
            .body(())
            .unwrap();
        assert_eq!(
            target_from_request(&req).unwrap(),
            ("example.com".to_string(), 8080)
        );
    }

    #[test]
    fn test_target_from_request_falls_back_to_host_header() {
        let req = Request::builder()
            .uri("/path")
            .header(HOST, "example.com")
            .body(())
            .unwrap();
        assert_eq!(
            target_from_request(&req).unwrap(),
            ("example.com".to_string(), 80)
        );
    }

    #[test]
    fn test_sanitize_strips_proxy_connection() {
        let mut req = Request::builder()
            .uri("/")
            .header("Proxy-Connection", "keep-alive")
            .body(())
            .unwrap();
        sanitize_request_headers(&mut req, "203.0.113.5".parse().unwrap());
        assert!(!req.headers().contains_key("proxy-connection"));
        assert_eq!(
            req.headers().get("x-forwarded-for").unwrap(),
            "203.0.113.5"
        );
    }

    #[test]
    fn test_sanitize_omits_xff_for_loopback_without_prior() {
        let mut req = Request::builder().uri("/").body(()).unwrap();
        sanitize_request_headers(&mut req, "127.0.0.1".parse().unwrap());
        assert!(!req.headers().contains_key("x-forwarded-for"));
    }

    #[test]
    fn test_timeout_error_maps_to_gateway_timeout() {
        let resp = error_response(&HttpProxyError::Timeout);
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_core_timeout_error_maps_to_gateway_timeout() {
        let resp = error_response(&HttpProxyError::Core(firefly_core::CoreError::Timeout));
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_missing_host_maps_to_bad_request() {
        let resp = error_response(&HttpProxyError::MissingHost);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_absolute_uri_rewrites_authority() {
        let req = Request::builder().uri("/foo?x=1").body(()).unwrap();
        let uri = absolute_uri(&req, "93.184.216.34", 80).unwrap();
        assert_eq!(uri.to_string(), "http://93.184.216.34:80/foo?x=1");
    }

    #[tokio::test]
    async fn test_connect_tunnel_roundtrip() {
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut server = HttpProxyServer::new("127.0.0.1:0".parse().unwrap());
        let bound = server.start().await.unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        let req = format!(
            "CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n"
        );
        client.write_all(req.as_bytes()).await.unwrap();

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]);
        assert!(head.starts_with("HTTP/1.1 200"));

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }
}
