//! Identifiers and the family-tagged endpoint type.
//!
//! Every address handed around the mesh is an [`Endpoint`]: an IPv4 socket
//! address, an IPv6 socket address, or a domain endpoint for anonymity-overlay
//! targets. Normalization (IPv4-mapped IPv6 collapse, scope-id strip) happens
//! in the constructors so the rest of the system can compare endpoints
//! structurally without re-checking.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::TransportError;

/// Opaque 256-bit peer identifier, generated at node startup.
///
/// Equality is bit-exact; there is no authenticity binding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Generate a uniformly random peer id.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

/// Identifier of a hosted mesh network; used as the DHT key for
/// find-peers and announce operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId([u8; 32]);

impl NetworkId {
    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a random network id (tests and throwaway networks).
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({})", hex::encode(&self.0[..8]))
    }
}

/// Address family marker carried by an [`Endpoint`].
///
/// `Unspecified` marks domain endpoints (anonymity-overlay targets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    /// IPv4 socket address
    Ipv4,
    /// IPv6 socket address
    Ipv6,
    /// Domain endpoint with no routable IP
    Unspecified,
}

/// Which of the four transports a discovery path or DHT node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// The IPv4 internet
    Ipv4Internet,
    /// The IPv6 internet
    Ipv6Internet,
    /// A directly attached broadcast segment
    LocalNetwork,
    /// The anonymity overlay, reached through SOCKS
    AnonymityOverlay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4Internet => write!(f, "ipv4"),
            Self::Ipv6Internet => write!(f, "ipv6"),
            Self::LocalNetwork => write!(f, "local"),
            Self::AnonymityOverlay => write!(f, "overlay"),
        }
    }
}

// Wire tags for the endpoint binary encoding.
const FAMILY_TAG_DOMAIN: u8 = 0;
const FAMILY_TAG_V4: u8 = 1;
const FAMILY_TAG_V6: u8 = 2;

/// A family-tagged peer address.
///
/// Construct through [`Endpoint::new`] or [`Endpoint::from_socket_addr`] so
/// that IPv4-mapped IPv6 addresses are collapsed to their IPv4 form and v6
/// scope ids are stripped; the derived `Eq`/`Hash` rely on that
/// canonicalization.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// IPv4 socket address
    V4(Ipv4Addr, u16),
    /// IPv6 socket address, scope id stripped
    V6(Ipv6Addr, u16),
    /// Domain endpoint (`.onion`-style overlay target)
    Domain(String, u16),
}

impl Endpoint {
    /// Canonical constructor from an IP address and port.
    #[must_use]
    pub fn new(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::V4(v4, port),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::V4(v4, port),
                None => Self::V6(v6, port),
            },
        }
    }

    /// Canonical constructor from a socket address (strips the v6 scope id).
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    /// Domain endpoint constructor.
    #[must_use]
    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        Self::Domain(host.into(), port)
    }

    /// The endpoint's address family.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        match self {
            Self::V4(..) => AddressFamily::Ipv4,
            Self::V6(..) => AddressFamily::Ipv6,
            Self::Domain(..) => AddressFamily::Unspecified,
        }
    }

    /// The endpoint's port.
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::V4(_, p) | Self::V6(_, p) | Self::Domain(_, p) => *p,
        }
    }

    /// Same endpoint with a different port.
    ///
    /// Used by the accept side of the handshake to rewrite an inbound
    /// ephemeral port to the peer's advertised service port.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            Self::V4(ip, _) => Self::V4(*ip, port),
            Self::V6(ip, _) => Self::V6(*ip, port),
            Self::Domain(host, _) => Self::Domain(host.clone(), port),
        }
    }

    /// The IP address, when the endpoint has one.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::V4(ip, _) => Some(IpAddr::V4(*ip)),
            Self::V6(ip, _) => Some(IpAddr::V6(*ip)),
            Self::Domain(..) => None,
        }
    }

    /// Concrete socket address, when the endpoint has one.
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::V4(ip, port) => Some(SocketAddr::V4(SocketAddrV4::new(*ip, *port))),
            Self::V6(ip, port) => Some(SocketAddr::V6(SocketAddrV6::new(*ip, *port, 0, 0))),
            Self::Domain(..) => None,
        }
    }

    /// Host portion formatted for proxy CONNECT requests.
    #[must_use]
    pub fn host_string(&self) -> String {
        match self {
            Self::V4(ip, _) => ip.to_string(),
            Self::V6(ip, _) => format!("[{ip}]"),
            Self::Domain(host, _) => host.clone(),
        }
    }

    /// True for addresses that are not globally routable: RFC 1918,
    /// loopback and link-local for IPv4; ULA, link-local and loopback
    /// for IPv6. Domain endpoints are never private.
    #[must_use]
    pub fn is_private(&self) -> bool {
        match self {
            Self::V4(ip, _) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
            Self::V6(ip, _) => {
                // ULA fc00::/7, link-local fe80::/10
                ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00
                    || (ip.segments()[0] & 0xffc0) == 0xfe80
            }
            Self::Domain(..) => false,
        }
    }

    /// Append the binary encoding: `[family u8][addr][port u16 LE]`,
    /// domains as `[len u8][utf8 bytes]`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::V4(ip, port) => {
                buf.push(FAMILY_TAG_V4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_le_bytes());
            }
            Self::V6(ip, port) => {
                buf.push(FAMILY_TAG_V6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_le_bytes());
            }
            Self::Domain(host, port) => {
                buf.push(FAMILY_TAG_DOMAIN);
                let bytes = host.as_bytes();
                debug_assert!(bytes.len() <= u8::MAX as usize);
                buf.push(bytes.len().min(u8::MAX as usize) as u8);
                buf.extend_from_slice(&bytes[..bytes.len().min(u8::MAX as usize)]);
                buf.extend_from_slice(&port.to_le_bytes());
            }
        }
    }

    /// Decode one endpoint from the front of `buf`.
    ///
    /// Returns the endpoint and the number of bytes consumed. The decoded
    /// endpoint is re-canonicalized, so an IPv4-mapped IPv6 encoding can
    /// never smuggle a second representation into a map.
    ///
    /// # Errors
    ///
    /// `TransportError::Malformed` on an unknown family tag or truncation.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), TransportError> {
        let tag = *buf.first().ok_or(TransportError::malformed("empty endpoint"))?;
        match tag {
            FAMILY_TAG_V4 => {
                let rest = buf
                    .get(1..7)
                    .ok_or(TransportError::malformed("truncated v4 endpoint"))?;
                let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
                let port = u16::from_le_bytes([rest[4], rest[5]]);
                Ok((Self::new(IpAddr::V4(ip), port), 7))
            }
            FAMILY_TAG_V6 => {
                let rest = buf
                    .get(1..19)
                    .ok_or(TransportError::malformed("truncated v6 endpoint"))?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                let port = u16::from_le_bytes([rest[16], rest[17]]);
                Ok((Self::new(IpAddr::V6(Ipv6Addr::from(octets)), port), 19))
            }
            FAMILY_TAG_DOMAIN => {
                let len = *buf
                    .get(1)
                    .ok_or(TransportError::malformed("truncated domain endpoint"))?
                    as usize;
                let host = buf
                    .get(2..2 + len)
                    .ok_or(TransportError::malformed("truncated domain endpoint"))?;
                let host = std::str::from_utf8(host)
                    .map_err(|_| TransportError::malformed("domain is not utf-8"))?;
                let port_bytes = buf
                    .get(2 + len..4 + len)
                    .ok_or(TransportError::malformed("truncated domain endpoint"))?;
                let port = u16::from_le_bytes([port_bytes[0], port_bytes[1]]);
                Ok((Self::Domain(host.to_string(), port), 4 + len))
            }
            other => Err(TransportError::Malformed(
                format!("unknown endpoint family tag {other}").into(),
            )),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(ip, port) => write!(f, "{ip}:{port}"),
            Self::V6(ip, port) => write!(f, "[{ip}]:{port}"),
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({self})")
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_random_distinct() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_v4_mapped_v6_normalized() {
        let mapped: Ipv6Addr = "::ffff:192.0.2.7".parse().unwrap();
        let ep = Endpoint::new(IpAddr::V6(mapped), 4000);
        assert_eq!(ep, Endpoint::V4(Ipv4Addr::new(192, 0, 2, 7), 4000));
        assert_eq!(ep.family(), AddressFamily::Ipv4);
    }

    #[test]
    fn test_scope_id_stripped() {
        let addr: SocketAddr = "[fe80::1%25]:9000"
            .parse()
            .unwrap_or(SocketAddr::V6(SocketAddrV6::new(
                "fe80::1".parse().unwrap(),
                9000,
                0,
                25,
            )));
        let ep = Endpoint::from_socket_addr(addr);
        let sa = ep.to_socket_addr().unwrap();
        match sa {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 0),
            SocketAddr::V4(_) => panic!("expected v6"),
        }
    }

    #[test]
    fn test_mapped_and_plain_never_coexist() {
        let plain = Endpoint::new("10.1.2.3".parse().unwrap(), 80);
        let mapped = Endpoint::new("::ffff:10.1.2.3".parse().unwrap(), 80);
        let mut set = std::collections::HashSet::new();
        set.insert(plain);
        set.insert(mapped);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_private_classification() {
        assert!(Endpoint::new("192.168.1.10".parse().unwrap(), 1).is_private());
        assert!(Endpoint::new("10.0.0.1".parse().unwrap(), 1).is_private());
        assert!(Endpoint::new("127.0.0.1".parse().unwrap(), 1).is_private());
        assert!(Endpoint::new("169.254.9.9".parse().unwrap(), 1).is_private());
        assert!(!Endpoint::new("8.8.8.8".parse().unwrap(), 1).is_private());
        assert!(Endpoint::new("fd00::1".parse().unwrap(), 1).is_private());
        assert!(Endpoint::new("fe80::1".parse().unwrap(), 1).is_private());
        assert!(!Endpoint::new("2001:db8::1".parse().unwrap(), 1).is_private());
        assert!(!Endpoint::domain("example.onion", 1).is_private());
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let cases = [
            Endpoint::new("203.0.113.9".parse().unwrap(), 41700),
            Endpoint::new("2001:db8::42".parse().unwrap(), 1),
            Endpoint::domain("abcdefghij.onion", 65535),
        ];
        for ep in cases {
            let mut buf = Vec::new();
            ep.encode(&mut buf);
            let (decoded, consumed) = Endpoint::decode(&buf).unwrap();
            assert_eq!(decoded, ep);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Endpoint::decode(&[]).is_err());
        assert!(Endpoint::decode(&[9, 1, 2]).is_err());
        assert!(Endpoint::decode(&[FAMILY_TAG_V4, 1, 2]).is_err());
        assert!(Endpoint::decode(&[FAMILY_TAG_DOMAIN, 5, b'a']).is_err());
    }

    #[test]
    fn test_with_port() {
        let ep = Endpoint::new("203.0.113.9".parse().unwrap(), 55000);
        assert_eq!(ep.with_port(41700).port(), 41700);
        assert_eq!(ep.with_port(41700).ip(), ep.ip());
    }

    proptest::proptest! {
        #[test]
        fn prop_v4_roundtrip(a: u8, b: u8, c: u8, d: u8, port: u16) {
            let ep = Endpoint::V4(Ipv4Addr::new(a, b, c, d), port);
            let mut buf = Vec::new();
            ep.encode(&mut buf);
            let (decoded, _) = Endpoint::decode(&buf).unwrap();
            proptest::prop_assert_eq!(decoded, ep);
        }

        #[test]
        fn prop_v6_roundtrip(octets: [u8; 16], port: u16) {
            let ip = Ipv6Addr::from(octets);
            let ep = Endpoint::new(IpAddr::V6(ip), port);
            let mut buf = Vec::new();
            ep.encode(&mut buf);
            let (decoded, _) = Endpoint::decode(&buf).unwrap();
            // Decode re-canonicalizes, so a mapped input compares equal
            // through the constructor, not the raw variant.
            proptest::prop_assert_eq!(decoded, ep);
        }
    }
}
