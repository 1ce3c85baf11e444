//! Minimal raw HTTP/1.1 request/response framing used to forward a fully
//! buffered request over a channel-tunneled TCP socket (the non-CONNECT
//! `Channel` branch of the smart HTTP application, §4.7 "forward as
//! HTTP-over-SOCKS5").

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{HeaderMap, Method, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{HttpProxyError, Result};

pub(crate) async fn forward_over_stream(
    stream: &mut TcpStream,
    method: &Method,
    target: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    write_request(stream, method, target, headers, &body).await?;
    read_response(stream).await
}

async fn write_request(
    stream: &mut TcpStream,
    method: &Method,
    target: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<()> {
    let path = target.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut out = format!("{method} {path} HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            out.push_str(&format!("{name}: {v}\r\n"));
        }
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    stream.write_all(out.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

async fn read_response(stream: &mut TcpStream) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpProxyError::InvalidTarget(
                "channel closed before response headers".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 64 * 1024 {
            return Err(HttpProxyError::InvalidTarget(
                "response headers too large".to_string(),
            ));
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut body = buf[header_end + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("HTTP/1.1 502 Bad Gateway");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status).version(Version::HTTP_11);
    let mut content_length: Option<usize> = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().ok();
            }
            if name.eq_ignore_ascii_case("transfer-encoding") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            builder = builder.header(name, value);
        }
    }

    if let Some(len) = content_length {
        while body.len() < len {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(len);
    }

    let boxed = Full::new(Bytes::from(body))
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed();
    builder
        .body(boxed)
        .map_err(|e| HttpProxyError::InvalidTarget(e.to_string()))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn test_roundtrip_against_fixed_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        let resp = forward_over_stream(&mut stream, &Method::GET, &uri, &headers, Bytes::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }
}
