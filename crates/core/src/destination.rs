//! The matcher's input/output types: a destination to classify, and the
//! tagged decision it produces.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

/// `(host, port, proto)`. `host` is an IPv4/IPv6 literal or a DNS name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub proto: Proto,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, proto: Proto) -> Self {
        Self {
            host: host.into(),
            port,
            proto,
        }
    }
}

/// The matcher's tagged verdict (§3, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDecision {
    Direct,
    HostsOverride { addrs: Vec<IpAddr> },
    Channel { url: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_new() {
        let d = Destination::new("example.com", 443, Proto::Tcp);
        assert_eq!(d.host, "example.com");
        assert_eq!(d.port, 443);
        assert_eq!(d.proto, Proto::Tcp);
    }

    #[test]
    fn test_forward_decision_variants_distinct() {
        assert_ne!(ForwardDecision::Direct, ForwardDecision::Channel { url: "x".into() });
    }
}
