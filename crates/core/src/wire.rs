//! SOCKS5 wire codec: pack/unpack for the init handshake, request, reply, and
//! the UDP-over-SOCKS datagram header (RFC 1928). Pure: no I/O here.

use crate::error::{CoreError, Result};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const NO_AUTHENTICATION_REQUIRED: u8 = 0x00;
pub const NO_ACCEPTABLE_METHODS: u8 = 0xff;

/// SOCKS5 command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Connect,
    Bind,
    UdpAssociate,
}

impl Cmd {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(Cmd::Connect),
            0x02 => Ok(Cmd::Bind),
            0x03 => Ok(Cmd::UdpAssociate),
            other => Err(CoreError::Format(format!("unknown cmd {other:#04x}"))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Cmd::Connect => 0x01,
            Cmd::Bind => 0x02,
            Cmd::UdpAssociate => 0x03,
        }
    }
}

/// SOCKS5 reply codes (the `rep` field of a Reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Rep {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// An address as carried on the wire: IPv4, IPv6, or a domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    V4([u8; 4]),
    V6([u8; 16]),
    Domain(String),
}

impl Addr {
    fn addrtype(&self) -> u8 {
        match self {
            Addr::V4(_) => 0x01,
            Addr::Domain(_) => 0x03,
            Addr::V6(_) => 0x04,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Addr::V4(b) => out.extend_from_slice(b),
            Addr::V6(b) => out.extend_from_slice(b),
            Addr::Domain(name) => {
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
    }

    /// Decode an address of the given addrtype from `buf`, returning the
    /// decoded address and the number of bytes consumed.
    fn decode(addrtype: u8, buf: &[u8]) -> Result<(Self, usize)> {
        match addrtype {
            0x01 => {
                if buf.len() < 4 {
                    return Err(CoreError::Format("truncated ipv4 address".into()));
                }
                let mut b = [0u8; 4];
                b.copy_from_slice(&buf[..4]);
                Ok((Addr::V4(b), 4))
            }
            0x04 => {
                if buf.len() < 16 {
                    return Err(CoreError::Format("truncated ipv6 address".into()));
                }
                let mut b = [0u8; 16];
                b.copy_from_slice(&buf[..16]);
                Ok((Addr::V6(b), 16))
            }
            0x03 => {
                if buf.is_empty() {
                    return Err(CoreError::Format("truncated domain length".into()));
                }
                let len = buf[0] as usize;
                if buf.len() < 1 + len {
                    return Err(CoreError::Format("truncated domain name".into()));
                }
                let name = String::from_utf8_lossy(&buf[1..1 + len]).into_owned();
                Ok((Addr::Domain(name), 1 + len))
            }
            other => Err(CoreError::Format(format!(
                "unknown address type {other:#04x}"
            ))),
        }
    }
}

/// The client's greeting: version + offered auth methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl InitRequest {
    pub fn new_no_auth() -> Self {
        Self {
            version: SOCKS5_VERSION,
            methods: vec![NO_AUTHENTICATION_REQUIRED],
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.methods.len());
        out.push(self.version);
        out.push(self.methods.len() as u8);
        out.extend_from_slice(&self.methods);
        out
    }

    /// `header` is the first two bytes (version, nmethods); `methods` is the
    /// remaining `nmethods` bytes.
    pub fn unpack(header: &[u8], methods: &[u8]) -> Result<Self> {
        if header.len() < 2 {
            return Err(CoreError::Format("truncated init request header".into()));
        }
        let version = header[0];
        let nmethods = header[1] as usize;
        if methods.len() != nmethods {
            return Err(CoreError::Format("init request method count mismatch".into()));
        }
        Ok(Self {
            version,
            methods: methods.to_vec(),
        })
    }
}

/// The server's reply to the greeting: chosen auth method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitReply {
    pub version: u8,
    pub method: u8,
}

impl InitReply {
    pub fn accept() -> Self {
        Self {
            version: SOCKS5_VERSION,
            method: NO_AUTHENTICATION_REQUIRED,
        }
    }

    pub fn reject() -> Self {
        Self {
            version: SOCKS5_VERSION,
            method: NO_ACCEPTABLE_METHODS,
        }
    }

    pub fn pack(&self) -> [u8; 2] {
        [self.version, self.method]
    }

    pub fn unpack(buf: &[u8; 2]) -> Self {
        Self {
            version: buf[0],
            method: buf[1],
        }
    }
}

/// A SOCKS5 request: `version cmd rsv addrtype addr port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: Cmd,
    pub addr: Addr,
    pub port: u16,
}

impl Request {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 16);
        out.push(SOCKS5_VERSION);
        out.push(self.cmd.to_byte());
        out.push(0x00); // rsv
        out.push(self.addr.addrtype());
        self.addr.encode(&mut out);
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Parses a complete request from `buf` (the fixed 4-byte header plus the
    /// address and 2-byte port already concatenated).
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(CoreError::Format("truncated request header".into()));
        }
        if buf[0] != SOCKS5_VERSION {
            return Err(CoreError::Protocol(format!("unsupported version {:#04x}", buf[0])));
        }
        let cmd = Cmd::from_byte(buf[1])?;
        let addrtype = buf[3];
        let (addr, consumed) = Addr::decode(addrtype, &buf[4..])?;
        let port_off = 4 + consumed;
        if buf.len() < port_off + 2 {
            return Err(CoreError::Format("truncated request port".into()));
        }
        let port = u16::from_be_bytes([buf[port_off], buf[port_off + 1]]);
        Ok(Self { cmd, addr, port })
    }
}

/// A SOCKS5 reply: `version rep rsv addrtype bndaddr bndport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub rep: Rep,
    pub addr: Addr,
    pub port: u16,
}

impl Reply {
    pub fn success(addr: Addr, port: u16) -> Self {
        Self {
            rep: Rep::Succeeded,
            addr,
            port,
        }
    }

    pub fn failure(rep: Rep, addr: Addr, port: u16) -> Self {
        Self { rep, addr, port }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 16);
        out.push(SOCKS5_VERSION);
        out.push(self.rep as u8);
        out.push(0x00); // rsv
        out.push(self.addr.addrtype());
        self.addr.encode(&mut out);
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(CoreError::Format("truncated reply header".into()));
        }
        if buf[0] != SOCKS5_VERSION {
            return Err(CoreError::Protocol(format!("unsupported version {:#04x}", buf[0])));
        }
        let rep = match buf[1] {
            0x00 => Rep::Succeeded,
            0x01 => Rep::GeneralFailure,
            0x02 => Rep::ConnectionNotAllowed,
            0x03 => Rep::NetworkUnreachable,
            0x04 => Rep::HostUnreachable,
            0x05 => Rep::ConnectionRefused,
            0x06 => Rep::TtlExpired,
            0x07 => Rep::CommandNotSupported,
            0x08 => Rep::AddressTypeNotSupported,
            other => return Err(CoreError::Format(format!("unknown rep code {other:#04x}"))),
        };
        let addrtype = buf[3];
        let (addr, consumed) = Addr::decode(addrtype, &buf[4..])?;
        let port_off = 4 + consumed;
        if buf.len() < port_off + 2 {
            return Err(CoreError::Format("truncated reply port".into()));
        }
        let port = u16::from_be_bytes([buf[port_off], buf[port_off + 1]]);
        Ok(Self { rep, addr, port })
    }
}

/// A UDP-over-SOCKS datagram header plus payload: `rsv(2)=0 frag addrtype addr port payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub frag: u8,
    pub addr: Addr,
    pub port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 16 + self.payload.len());
        out.extend_from_slice(&[0x00, 0x00]); // rsv
        out.push(self.frag);
        out.push(self.addr.addrtype());
        self.addr.encode(&mut out);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(CoreError::Format("truncated udp datagram header".into()));
        }
        let frag = buf[2];
        let addrtype = buf[3];
        let (addr, consumed) = Addr::decode(addrtype, &buf[4..])?;
        let port_off = 4 + consumed;
        if buf.len() < port_off + 2 {
            return Err(CoreError::Format("truncated udp datagram port".into()));
        }
        let port = u16::from_be_bytes([buf[port_off], buf[port_off + 1]]);
        let payload = buf[port_off + 2..].to_vec();
        Ok(Self {
            frag,
            addr,
            port,
            payload,
        })
    }

    /// Only `frag == 0` datagrams are accepted; fragmentation is unsupported.
    pub fn is_unfragmented(&self) -> bool {
        self.frag == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_request_roundtrip() {
        let req = InitRequest::new_no_auth();
        let packed = req.pack();
        let unpacked = InitRequest::unpack(&packed[..2], &packed[2..]).unwrap();
        assert_eq!(req, unpacked);
    }

    #[test]
    fn test_init_reply_roundtrip() {
        let reply = InitReply::accept();
        let packed = reply.pack();
        assert_eq!(InitReply::unpack(&packed), reply);
    }

    #[test]
    fn test_request_roundtrip_ipv4() {
        let req = Request {
            cmd: Cmd::Connect,
            addr: Addr::V4([93, 184, 216, 34]),
            port: 80,
        };
        let packed = req.pack();
        assert_eq!(Request::unpack(&packed).unwrap(), req);
    }

    #[test]
    fn test_request_roundtrip_domain() {
        let req = Request {
            cmd: Cmd::Connect,
            addr: Addr::Domain("example.com".to_string()),
            port: 443,
        };
        let packed = req.pack();
        assert_eq!(Request::unpack(&packed).unwrap(), req);
    }

    #[test]
    fn test_request_roundtrip_ipv6() {
        let req = Request {
            cmd: Cmd::UdpAssociate,
            addr: Addr::V6([0u8; 16]),
            port: 0,
        };
        let packed = req.pack();
        assert_eq!(Request::unpack(&packed).unwrap(), req);
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = Reply::success(Addr::V4([127, 0, 0, 1]), 1080);
        let packed = reply.pack();
        assert_eq!(Reply::unpack(&packed).unwrap(), reply);
    }

    #[test]
    fn test_udp_datagram_roundtrip() {
        let dg = UdpDatagram {
            frag: 0,
            addr: Addr::V4([93, 184, 216, 34]),
            port: 7,
            payload: b"ping".to_vec(),
        };
        let packed = dg.pack();
        assert_eq!(UdpDatagram::unpack(&packed).unwrap(), dg);
    }

    #[test]
    fn test_udp_datagram_fragment_dropped() {
        let dg = UdpDatagram {
            frag: 1,
            addr: Addr::V4([1, 2, 3, 4]),
            port: 1,
            payload: vec![],
        };
        assert!(!dg.is_unfragmented());
    }

    #[test]
    fn test_unknown_addrtype_is_format_error() {
        // version/cmd/rsv/addrtype=0x09
        let buf = [0x05, 0x01, 0x00, 0x09];
        let err = Request::unpack(&buf).unwrap_err();
        assert!(matches!(err, CoreError::Format(_)));
    }

    #[test]
    fn test_truncated_domain_is_format_error() {
        // addrtype=domain, length byte says 10 but only 2 bytes follow
        let buf = [0x05, 0x01, 0x00, 0x03, 10, b'a', b'b'];
        let err = Request::unpack(&buf).unwrap_err();
        assert!(matches!(err, CoreError::Format(_)));
    }

    #[test]
    fn test_unsupported_version_is_protocol_error() {
        let buf = [0x04, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        let err = Request::unpack(&buf).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }
}
