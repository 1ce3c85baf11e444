//! SOCKS5 listener (§4.3, §4.6): handshake/codec primitives, the base relay,
//! and the matcher-aware smart session built on top of it.

pub mod codec_io;
pub mod relay;
pub mod smart;
mod udp;

pub use relay::{serve_direct, SocksServer};
pub use smart::{serve_smart, ForwarderTable};
