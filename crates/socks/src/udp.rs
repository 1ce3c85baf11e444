//! Matcher-aware UDP_ASSOCIATE dispatch (§4.6): the first client datagram's
//! destination decides Direct/HostsOverride/Channel, mirroring the CONNECT
//! dispatch in `smart.rs`. Grounded on `smart_relay.py`'s `smart_socks_udp`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use firefly_core::wire::{Request, UdpDatagram};
use firefly_core::{CoreError, Destination, ForwardDecision, Proto, Result};
use firefly_matcher::Matcher;
use firefly_net::{bind_connected_udp, bind_local_udp, pipe_udp};

use crate::codec_io::reply_success;
use crate::relay::{
    addr_allowed, socket_addr_from_request, socket_addr_to_wire, wait_for_first_datagram,
};

pub async fn serve_smart_udp_associate(
    mut client: TcpStream,
    request: Request,
    matcher: Arc<Matcher>,
    timeout: Duration,
) -> Result<()> {
    let client_udp = bind_local_udp(&client).await?;
    let bound = client_udp.local_addr()?;
    reply_success(&mut client, socket_addr_to_wire(bound), bound.port()).await?;

    let client_associate = socket_addr_from_request(&request);
    let (first_data, first_client_addr, first_dest) =
        match wait_for_first_datagram(&client, &client_udp, client_associate, timeout).await? {
            Some(v) => v,
            None => return Ok(()),
        };

    let destination = Destination::new(first_dest.ip().to_string(), first_dest.port(), Proto::Udp);
    match matcher.find(&destination) {
        ForwardDecision::Direct => {
            pump_direct(
                client,
                client_udp,
                client_associate,
                first_client_addr,
                first_data,
                first_dest,
                timeout,
            )
            .await
        }
        ForwardDecision::HostsOverride { addrs } => {
            let override_dest = addrs
                .first()
                .map(|ip| SocketAddr::new(*ip, first_dest.port()))
                .ok_or_else(|| CoreError::AddressUnreachable(destination.host.clone()))?;
            pump_direct(
                client,
                client_udp,
                client_associate,
                first_client_addr,
                first_data,
                override_dest,
                timeout,
            )
            .await
        }
        ForwardDecision::Channel { url } => {
            tracing::warn!(%url, "udp channel forwarding not supported, dropping association");
            Ok(())
        }
    }
}

async fn pump_direct(
    client: TcpStream,
    client_udp: tokio::net::UdpSocket,
    client_associate: SocketAddr,
    first_client_addr: SocketAddr,
    first_data: Vec<u8>,
    dest: SocketAddr,
    timeout: Duration,
) -> Result<()> {
    let remote_udp = bind_connected_udp(dest).await?;
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
            let dg = UdpDatagram::unpack(bytes).ok()?;
            if !dg.is_unfragmented() {
                tracing::warn!("dropping fragmented udp datagram");
                return None;
            }
            Some(dg.payload)
        },
        move |bytes| {
            let dg = UdpDatagram {
                frag: 0,
                addr: socket_addr_to_wire(dest),
                port: dest.port(),
                payload: bytes.to_vec(),
            };
            Some(dg.pack())
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_constructed_from_udp_first_packet() {
        let dest = Destination::new("203.0.113.9", 53, Proto::Udp);
        assert_eq!(dest.proto, Proto::Udp);
        assert_eq!(dest.port, 53);
    }
}
