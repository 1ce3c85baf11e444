//! Async read/write helpers wrapping `firefly_core::wire` over a `TcpStream`.
//!
//! Grounded on `utils.py`'s `basic_handshake_server`/`read_request`/
//! `request_success`/`request_fail` read-write sequences.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use firefly_core::wire::{self, Addr, InitReply, Rep, Reply, Request};
use firefly_core::{CoreError, Result};

/// Offer/accept no-auth. Returns `Ok(true)` if the client offered it and we
/// accepted; `Ok(false)` if we replied `NO_ACCEPTABLE_METHODS` (caller closes
/// without further reply, per §4.3).
pub async fn basic_handshake_server(stream: &mut TcpStream) -> Result<bool> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    if nmethods > 0 {
        stream.read_exact(&mut methods).await?;
    }
    let init = wire::InitRequest::unpack(&header, &methods)?;
    if init.version != wire::SOCKS5_VERSION {
        return Err(CoreError::Protocol(format!(
            "unsupported socks version {:#04x}",
            init.version
        )));
    }
    if !init.methods.contains(&wire::NO_AUTHENTICATION_REQUIRED) {
        stream.write_all(&InitReply::reject().pack()).await?;
        return Ok(false);
    }
    stream.write_all(&InitReply::accept().pack()).await?;
    Ok(true)
}

/// Client-side handshake: offer no-auth, verify the server accepted it.
pub async fn basic_handshake_client(stream: &mut TcpStream) -> Result<bool> {
    stream
        .write_all(&wire::InitRequest::new_no_auth().pack())
        .await?;
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    let reply = InitReply::unpack(&buf);
    Ok(reply.method == wire::NO_AUTHENTICATION_REQUIRED)
}

/// Read a complete SOCKS5 request: fixed header, variable-length address,
/// fixed port.
pub async fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let addrtype = header[3];
    let mut addr_buf = read_addr_body(stream, addrtype).await?;
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    addr_buf.extend_from_slice(&port_buf);

    let mut full = header.to_vec();
    full.extend_from_slice(&addr_buf);
    Request::unpack(&full)
}

/// Send a request (used by the client side of a smart/downstream session).
pub async fn send_request(stream: &mut TcpStream, request: &Request) -> Result<()> {
    stream.write_all(&request.pack()).await?;
    Ok(())
}

/// Read a complete SOCKS5 reply.
pub async fn read_reply(stream: &mut TcpStream) -> Result<Reply> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let addrtype = header[3];
    let mut addr_buf = read_addr_body(stream, addrtype).await?;
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    addr_buf.extend_from_slice(&port_buf);

    let mut full = header.to_vec();
    full.extend_from_slice(&addr_buf);
    Reply::unpack(&full)
}

pub async fn reply_success(stream: &mut TcpStream, addr: Addr, port: u16) -> Result<()> {
    stream.write_all(&Reply::success(addr, port).pack()).await?;
    Ok(())
}

pub async fn reply_failure(stream: &mut TcpStream, rep: Rep, addr: Addr, port: u16) -> Result<()> {
    stream
        .write_all(&Reply::failure(rep, addr, port).pack())
        .await?;
    Ok(())
}

async fn read_addr_body(stream: &mut TcpStream, addrtype: u8) -> Result<Vec<u8>> {
    match addrtype {
        0x01 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            Ok(buf.to_vec())
        }
        0x04 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            Ok(buf.to_vec())
        }
        0x03 => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let mut name_buf = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut name_buf).await?;
            let mut out = len_buf.to_vec();
            out.extend_from_slice(&name_buf);
            Ok(out)
        }
        other => Err(CoreError::Format(format!("unknown address type {other:#04x}"))),
    }
}
