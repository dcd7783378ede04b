use std::fmt;
use std::net::Ipv4Addr;
use bytes::Buf;
use serde::Serialize;

// A peer is packed on the wire as 6 bytes: 4 address octets then the
// port in big-endian.
pub const PEER_WIRE_LEN: usize = 6;

// Topic identifier grouping peers interested in the same content.
// Rendered as lowercase hex when supplied as raw bytes, so the same id
// in distinct encodings maps to the same topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&[u8]> for Topic {
    fn from(bytes: &[u8]) -> Self {
        Topic(hex::encode(bytes))
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic(s.to_ascii_lowercase())
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Topic::from(s.as_str())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Peer {

    pub host: Ipv4Addr,

    pub port: u16,

}

impl Peer {

    pub fn new(host: Ipv4Addr, port: u16) -> Self {
        Peer { host, port }
    }

    // 0.0.0.0 is the "sender's apparent address" sentinel.
    pub fn is_unspecified(&self) -> bool {
        self.host.is_unspecified()
    }

    // Substitute the sentinel with the address the transport observed.
    pub fn resolve(self, src: Ipv4Addr) -> Self {
        if self.host.is_unspecified() {
            Peer { host: src, port: self.port }
        } else {
            self
        }
    }

    pub fn to_wire(&self) -> [u8; PEER_WIRE_LEN] {
        let mut buf = [0u8; PEER_WIRE_LEN];
        buf[..4].copy_from_slice(&self.host.octets());
        buf[4..].copy_from_slice(&self.port.to_be_bytes());
        buf
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// A trailing partial record is silently ignored.
pub fn decode_list(mut buf: &[u8]) -> Vec<Peer> {
    let mut peers = Vec::with_capacity(buf.len() / PEER_WIRE_LEN);
    while buf.remaining() >= PEER_WIRE_LEN {
        let host = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        peers.push(Peer { host, port });
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn pack(peers: &[Peer]) -> Vec<u8> {
        peers.iter().flat_map(|p| p.to_wire()).collect()
    }

    #[test]
    fn test_wire_roundtrip() {
        let peer = Peer::new(Ipv4Addr::new(10, 0, 0, 1), 4000);
        assert_eq!(peer.to_wire(), hex!("0a000001 0fa0"));
        assert_eq!(decode_list(&peer.to_wire()), vec![peer]);

        let peers = vec![
            Peer::new(Ipv4Addr::new(192, 0, 2, 7), 53),
            Peer::new(Ipv4Addr::new(0, 0, 0, 0), 65535),
            Peer::new(Ipv4Addr::new(255, 255, 255, 255), 1),
        ];
        assert_eq!(decode_list(&pack(&peers)), peers);
    }

    #[test]
    fn test_truncated_list_ignored() {
        let mut buf = pack(&[Peer::new(Ipv4Addr::new(10, 0, 0, 1), 4000)]);
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode_list(&buf).len(), 1);
        assert_eq!(decode_list(&[9, 9]), vec![]);
    }

    #[test]
    fn test_sentinel_substitution() {
        let src = Ipv4Addr::new(1, 2, 3, 4);
        let peer = Peer::new(Ipv4Addr::UNSPECIFIED, 4000).resolve(src);
        assert_eq!(peer, Peer::new(src, 4000));
        let peer = Peer::new(Ipv4Addr::new(10, 0, 0, 1), 4000).resolve(src);
        assert_eq!(peer.host, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_topic_encodings_agree() {
        assert_eq!(Topic::from(&[0xab_u8, 0xcd][..]), Topic::from("ABCD"));
        assert_eq!(Topic::from("example").as_str(), "example");
    }
}
