//! `X-Udp-Pkts` wire framing: packing/parsing the length list that lets a
//! meek peer reassemble concatenated SOCKS UDP datagrams from a POST body
//! (§4.8 "UDP framing on the wire", §8 "Meek framing round trip").

use crate::error::{MeekError, Result};

/// Concatenates `datagrams` and returns the body alongside the
/// comma-separated length list for `X-Udp-Pkts`.
pub fn pack_udp_pkts(datagrams: &[Vec<u8>]) -> (Vec<u8>, String) {
    let mut body = Vec::new();
    for d in datagrams {
        body.extend_from_slice(d);
    }
    let lengths = datagrams
        .iter()
        .map(|d| d.len().to_string())
        .collect::<Vec<_>>()
        .join(",");
    (body, lengths)
}

/// Splits `body` back into datagrams per the `X-Udp-Pkts` length list.
pub fn unpack_udp_pkts(body: &[u8], lengths_header: &str) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    for len_str in lengths_header.split(',').filter(|s| !s.is_empty()) {
        let len: usize = len_str
            .trim()
            .parse()
            .map_err(|_| MeekError::Protocol(format!("bad X-Udp-Pkts entry {len_str:?}")))?;
        if pos + len > body.len() {
            return Err(MeekError::Protocol("X-Udp-Pkts lengths exceed body".into()));
        }
        out.push(body[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_round_trip() {
        let datagrams = vec![b"ping".to_vec(), b"pong pong".to_vec(), b"x".to_vec()];
        let (body, lengths) = pack_udp_pkts(&datagrams);
        let decoded = unpack_udp_pkts(&body, &lengths).unwrap();
        assert_eq!(decoded, datagrams);
    }

    #[test]
    fn test_framing_round_trip_empty_list() {
        let (body, lengths) = pack_udp_pkts(&[]);
        assert!(body.is_empty());
        let decoded = unpack_udp_pkts(&body, &lengths).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_unpack_rejects_overrun_lengths() {
        let err = unpack_udp_pkts(b"ab", "10").unwrap_err();
        assert!(matches!(err, MeekError::Protocol(_)));
    }
}
