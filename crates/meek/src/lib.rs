//! Meek HTTP-façade transport (§4.8 client, §4.9 server): tunnels a SOCKS
//! byte stream inside a sequence of ordinary-looking HTTP POSTs so that a
//! passive observer of the wire sees only HTTP(S) traffic to a front domain.

mod client;
mod constants;
mod error;
mod framing;
mod pool;
mod relay;
mod server;
mod timer;

pub use client::run_session;
pub use constants::{
    CLIENT_IDLE_TIMEOUT, CLIENT_MAX_FAILURE, CLIENT_MAX_TRIES, HEADER_ERROR, HEADER_MODE,
    HEADER_MSGTYPE, HEADER_SESSION_ID, HEADER_UDP_PKTS, MODE_STREAM, MSGTYPE_DATA,
    MSGTYPE_TERMINATE, SERVER_SWEEP_INTERVAL, SERVER_TURNAROUND_MAX, SERVER_TURNAROUND_TIMEOUT,
};
pub use error::{MeekError, Result};
pub use framing::{pack_udp_pkts, unpack_udp_pkts};
pub use pool::HttpClientPool;
pub use relay::{build_relay_table, probe_relay, Relay, RelayConfig, RelayTable};
pub use server::MeekServerHandle;
