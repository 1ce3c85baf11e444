//! Meek server handler (§4.9): accepts HTTP POSTs, maps each session id to a
//! local real SOCKS5 connection, and bridges POST bodies/responses to that
//! connection's TCP/UDP traffic.
//!
//! Grounded on `examples/original_source/DEPRECATED_PYTHON_SRC/meeksocks/
//! server.py`'s `MeekSession` server class (`initialize`/`cmd_connect`/
//! `cmd_udp_associate`/`_fetch_resp`/`process`) and `meeks_clean_thread`'s
//! background sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures::stream;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use firefly_core::wire::{Cmd, Request as SocksRequest};
use firefly_net::bind_local_udp;
use firefly_socks::codec_io::{basic_handshake_client, read_reply, send_request};

use crate::constants::*;
use crate::error::{MeekError, Result};
use crate::framing::{pack_udp_pkts, unpack_udp_pkts};
use crate::timer::SharedIdleTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    WaitInit,
    WaitRequest,
    Tcp,
    Udp,
}

struct ServerSession {
    state: AsyncMutex<SessionState>,
    control_stream: AsyncMutex<Option<TcpStream>>,
    tcp_write: AsyncMutex<Option<OwnedWriteHalf>>,
    udp_sock: AsyncMutex<Option<Arc<UdpSocket>>>,
    out_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    timer: SharedIdleTimer,
    finished: AtomicBool,
}

impl ServerSession {
    fn new() -> Self {
        Self {
            state: AsyncMutex::new(SessionState::WaitInit),
            control_stream: AsyncMutex::new(None),
            tcp_write: AsyncMutex::new(None),
            udp_sock: AsyncMutex::new(None),
            out_rx: AsyncMutex::new(None),
            timer: SharedIdleTimer::new(CLIENT_IDLE_TIMEOUT),
            finished: AtomicBool::new(false),
        }
    }
}

/// Shared server state: the local real SOCKS5 relay to dial into, and the
/// live session map.
pub struct MeekServer {
    socks_addr: SocketAddr,
    sessions: SyncMutex<HashMap<String, Arc<ServerSession>>>,
}

impl MeekServer {
    pub fn new(socks_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            socks_addr,
            sessions: SyncMutex::new(HashMap::new()),
        })
    }

    fn session_for(self: &Arc<Self>, session_id: &str) -> Arc<ServerSession> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(ServerSession::new()))
            .clone()
    }

    fn terminate(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().remove(session_id) {
            session.finished.store(true, Ordering::Relaxed);
        }
    }

    /// Drops sessions that have gone idle past `SERVER_TURNAROUND_MAX` since
    /// their last read/write, mirroring `meeks_clean_thread`.
    fn sweep(&self) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, session| {
            let dead = session.finished.load(Ordering::Relaxed) || session.timer.timed_out();
            !dead
        });
    }
}

async fn ensure_initialized(server: &Arc<MeekServer>, session: &Arc<ServerSession>) -> Result<()> {
    let mut state = session.state.lock().await;
    if *state != SessionState::WaitInit {
        return Ok(());
    }
    let mut stream = TcpStream::connect(server.socks_addr).await?;
    if !basic_handshake_client(&mut stream).await? {
        return Err(MeekError::Protocol(
            "local socks relay rejected handshake".into(),
        ));
    }
    *session.control_stream.lock().await = Some(stream);
    *state = SessionState::WaitRequest;
    Ok(())
}

/// `WaitRequest` state: the POST body is a raw SOCKS5 `Request`; forward it
/// to the local relay, return its `Reply` bytes as the response.
async fn handle_request_frame(session: &Arc<ServerSession>, body: &[u8]) -> Result<Vec<u8>> {
    let request = SocksRequest::unpack(body)?;
    let mut stream_guard = session.control_stream.lock().await;
    let stream = stream_guard
        .as_mut()
        .ok_or_else(|| MeekError::Protocol("no control stream".into()))?;

    match request.cmd {
        Cmd::UdpAssociate => {
            let udp_sock = bind_local_udp(stream).await?;
            let bound = udp_sock.local_addr()?;
            let relayed = SocksRequest {
                cmd: Cmd::UdpAssociate,
                addr: match bound.ip() {
                    std::net::IpAddr::V4(v4) => firefly_core::wire::Addr::V4(v4.octets()),
                    std::net::IpAddr::V6(v6) => firefly_core::wire::Addr::V6(v6.octets()),
                },
                port: bound.port(),
            };
            send_request(stream, &relayed).await?;
            let reply = read_reply(stream).await?;
            let target = socket_addr_from_reply(&reply);
            drop(stream_guard);

            let udp_sock = Arc::new(udp_sock);
            if let Some(target) = target {
                udp_sock.connect(target).await.ok();
            }
            *session.udp_sock.lock().await = Some(udp_sock.clone());
            spawn_udp_reader(session.clone(), udp_sock).await;
            *session.state.lock().await = SessionState::Udp;
            Ok(reply.pack())
        }
        Cmd::Connect | Cmd::Bind => {
            send_request(stream, &request).await?;
            let reply = read_reply(stream).await?;
            drop(stream_guard);
            if matches!(request.cmd, Cmd::Connect) {
                promote_to_tcp(session).await?;
            }
            Ok(reply.pack())
        }
    }
}

fn socket_addr_from_reply(reply: &firefly_core::wire::Reply) -> Option<SocketAddr> {
    use firefly_core::wire::Addr;
    match &reply.addr {
        Addr::V4(b) => Some(SocketAddr::new(std::net::IpAddr::from(*b), reply.port)),
        Addr::V6(b) => Some(SocketAddr::new(std::net::IpAddr::from(*b), reply.port)),
        Addr::Domain(_) => None,
    }
}

async fn promote_to_tcp(session: &Arc<ServerSession>) -> Result<()> {
    let stream = session
        .control_stream
        .lock()
        .await
        .take()
        .ok_or_else(|| MeekError::Protocol("no control stream to promote".into()))?;
    let (read_half, write_half) = stream.into_split();
    *session.tcp_write.lock().await = Some(write_half);

    let (tx, rx) = mpsc::unbounded_channel();
    *session.out_rx.lock().await = Some(rx);

    let finished = session.clone();
    tokio::spawn(async move {
        let mut read_half = read_half;
        let mut buf = vec![0u8; MAX_PAYLOAD_LENGTH];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    finished.timer.reset();
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
        finished.finished.store(true, Ordering::Relaxed);
    });
    *session.state.lock().await = SessionState::Tcp;
    Ok(())
}

async fn spawn_udp_reader(session: Arc<ServerSession>, udp_sock: Arc<UdpSocket>) {
    let (tx, rx) = mpsc::unbounded_channel();
    *session.out_rx.lock().await = Some(rx);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PAYLOAD_LENGTH];
        loop {
            match udp_sock.recv(&mut buf).await {
                Ok(n) => {
                    session.timer.reset();
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Pulls whatever output is already buffered, waiting up to
/// `SERVER_TURNAROUND_TIMEOUT` for at least one chunk if none is (§4.9
/// "Turnaround control").
async fn fetch_resp(
    out_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    max_wait: Duration,
) -> Vec<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + max_wait;
    let mut collected = Vec::new();
    loop {
        while let Ok(chunk) = out_rx.try_recv() {
            collected.push(chunk);
        }
        if !collected.is_empty() || tokio::time::Instant::now() >= deadline {
            return collected;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        tokio::select! {
            maybe = out_rx.recv() => {
                match maybe {
                    Some(chunk) => collected.push(chunk),
                    None => return collected,
                }
            }
            _ = tokio::time::sleep(remaining) => return collected,
        }
    }
}

fn response_headers(session_id: &str, msg_type: &str, error: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(session_id) {
        headers.insert(HeaderName::from_static(HEADER_SESSION_ID), v);
    }
    headers.insert(
        HeaderName::from_static(HEADER_MSGTYPE),
        HeaderValue::from_str(msg_type).unwrap_or(HeaderValue::from_static(MSGTYPE_DATA)),
    );
    if let Some(reason) = error {
        if let Ok(v) = HeaderValue::from_str(reason) {
            headers.insert(HeaderName::from_static(HEADER_ERROR), v);
        }
    }
    headers
}

async fn handle_post(
    State(server): State<Arc<MeekServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session_id = headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if session_id.is_empty() {
        let resp_headers = response_headers("", MSGTYPE_DATA, Some("SessionID Missed"));
        return (StatusCode::OK, resp_headers, Body::empty()).into_response();
    }

    let msg_type = headers
        .get(HEADER_MSGTYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(MSGTYPE_DATA);

    if msg_type == MSGTYPE_TERMINATE {
        server.terminate(&session_id);
        let resp_headers = response_headers(&session_id, MSGTYPE_TERMINATE, None);
        return (StatusCode::OK, resp_headers, Body::empty()).into_response();
    }

    let session = server.session_for(&session_id);
    match dispatch(&server, &session, &session_id, &headers, &body).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "meek server session error");
            server.terminate(&session_id);
            let resp_headers = response_headers(&session_id, MSGTYPE_DATA, Some("Internal Error"));
            (StatusCode::OK, resp_headers, Body::empty()).into_response()
        }
    }
}

async fn dispatch(
    server: &Arc<MeekServer>,
    session: &Arc<ServerSession>,
    session_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response> {
    ensure_initialized(server, session).await?;
    let state = *session.state.lock().await;

    if state == SessionState::WaitRequest {
        let reply_bytes = handle_request_frame(session, body).await?;
        let resp_headers = response_headers(session_id, MSGTYPE_DATA, None);
        return Ok((StatusCode::OK, resp_headers, Body::from(reply_bytes)).into_response());
    }

    let is_udp = state == SessionState::Udp;
    if is_udp {
        if !body.is_empty() {
            let lengths = headers
                .get(HEADER_UDP_PKTS)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let datagrams = unpack_udp_pkts(body, lengths)?;
            let udp_guard = session.udp_sock.lock().await;
            if let Some(sock) = udp_guard.as_ref() {
                for dg in datagrams {
                    sock.send(&dg).await?;
                }
            }
        }
    } else if !body.is_empty() {
        let mut write_guard = session.tcp_write.lock().await;
        if let Some(write_half) = write_guard.as_mut() {
            write_half.write_all(body).await?;
        }
    }

    let stream_mode = headers
        .get(HEADER_MODE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == MODE_STREAM)
        .unwrap_or(false);

    if stream_mode && state == SessionState::Tcp {
        return Ok(build_streaming_response(session.clone()));
    }

    let mut out_guard = session.out_rx.lock().await;
    let chunks = match out_guard.as_mut() {
        Some(rx) => fetch_resp(rx, SERVER_TURNAROUND_TIMEOUT).await,
        None => Vec::new(),
    };
    drop(out_guard);

    if is_udp {
        let (payload, lengths) = pack_udp_pkts(&chunks);
        let mut resp_headers = response_headers(session_id, MSGTYPE_DATA, None);
        if let Ok(v) = HeaderValue::from_str(&lengths) {
            resp_headers.insert(HeaderName::from_static(HEADER_UDP_PKTS), v);
        }
        Ok((StatusCode::OK, resp_headers, Body::from(payload)).into_response())
    } else {
        let mut payload = Vec::new();
        for chunk in chunks {
            payload.extend_from_slice(&chunk);
        }
        let resp_headers = response_headers(session_id, MSGTYPE_DATA, None);
        Ok((StatusCode::OK, resp_headers, Body::from(payload)).into_response())
    }
}

fn build_streaming_response(session: Arc<ServerSession>) -> Response {
    let deadline = tokio::time::Instant::now() + SERVER_TURNAROUND_MAX;
    let body_stream = stream::unfold(session, move |session| async move {
        if session.finished.load(Ordering::Relaxed) || tokio::time::Instant::now() >= deadline {
            return None;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let mut out_guard = session.out_rx.lock().await;
        let rx = out_guard.as_mut()?;
        let chunk = tokio::select! {
            maybe = rx.recv() => maybe,
            _ = tokio::time::sleep(remaining) => None,
        };
        drop(out_guard);
        match chunk {
            Some(data) => Some((Ok::<_, std::io::Error>(Bytes::from(data)), session)),
            None => None,
        }
    });
    (StatusCode::OK, Body::from_stream(body_stream)).into_response()
}

/// Owns the axum HTTP server that implements the meek wire protocol.
pub struct MeekServerHandle {
    listen_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
    sweep_handle: Option<JoinHandle<()>>,
}

impl MeekServerHandle {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            handle: None,
            sweep_handle: None,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub async fn start(&mut self, socks_addr: SocketAddr) -> Result<SocketAddr> {
        let server = MeekServer::new(socks_addr);
        let app = Router::new()
            .route("/", post(handle_post))
            .with_state(server.clone());

        let listener = TcpListener::bind(self.listen_addr).await?;
        let bound = listener.local_addr()?;
        self.listen_addr = bound;

        self.handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::warn!(error = %e, "meek server exited with error");
            }
        }));

        let sweep_server = server;
        self.sweep_handle = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SERVER_SWEEP_INTERVAL).await;
                sweep_server.sweep();
            }
        }));

        Ok(bound)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for MeekServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_session_id_response_carries_error_header() {
        let headers = response_headers("", MSGTYPE_DATA, Some("SessionID Missed"));
        assert_eq!(headers.get(HEADER_ERROR).unwrap(), "SessionID Missed");
    }

    #[test]
    fn test_terminate_response_echoes_msgtype() {
        let headers = response_headers("abc123", MSGTYPE_TERMINATE, None);
        assert_eq!(headers.get(HEADER_MSGTYPE).unwrap(), MSGTYPE_TERMINATE);
        assert!(headers.get(HEADER_ERROR).is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_finished_sessions() {
        let server = MeekServer::new("127.0.0.1:1".parse().unwrap());
        let session = server.session_for("deadbeef00000000");
        session.finished.store(true, Ordering::Relaxed);
        server.sweep();
        assert!(server.sessions.lock().get("deadbeef00000000").is_none());
    }

    #[tokio::test]
    async fn test_terminate_idempotent() {
        let server = MeekServer::new("127.0.0.1:1".parse().unwrap());
        let _session = server.session_for("0123456789abcdef");
        server.terminate("0123456789abcdef");
        server.terminate("0123456789abcdef");
        assert!(server.sessions.lock().is_empty());
    }
}
