//! Local-segment discovery beacon.
//!
//! A beacon is a three-byte UDP packet `[version][dht_port u16 LE]` sent to
//! the broadcast address (IPv4) or the site-local multicast group
//! `FF12::1` (IPv6) on port 41988. Receivers combine the datagram's source
//! IP with the advertised port to form the sender's local DHT endpoint.

use std::net::Ipv6Addr;

use crate::error::{DiscoveryError, Result};

/// Well-known UDP port for local-segment discovery.
pub const DISCOVERY_PORT: u16 = 41988;

/// Current beacon packet version.
pub const BEACON_VERSION: u8 = 1;

/// Site-local multicast group for IPv6 beacons.
pub const IPV6_MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xFF12, 0, 0, 0, 0, 0, 0, 1);

/// Encoded beacon length.
pub const BEACON_LEN: usize = 3;

/// A decoded discovery beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    /// TCP port of the sender's local-segment DHT node.
    pub dht_port: u16,
}

impl Beacon {
    /// Build a beacon advertising `dht_port`.
    #[must_use]
    pub const fn new(dht_port: u16) -> Self {
        Self { dht_port }
    }

    /// Encode to the fixed three-byte frame.
    #[must_use]
    pub fn encode(&self) -> [u8; BEACON_LEN] {
        let port = self.dht_port.to_le_bytes();
        [BEACON_VERSION, port[0], port[1]]
    }

    /// Decode a received datagram.
    ///
    /// # Errors
    ///
    /// `TruncatedBeacon` for short packets, `UnsupportedBeaconVersion` when
    /// the version byte is not [`BEACON_VERSION`].
    pub fn decode(packet: &[u8]) -> Result<Self> {
        if packet.len() < BEACON_LEN {
            return Err(DiscoveryError::TruncatedBeacon(packet.len()));
        }
        if packet[0] != BEACON_VERSION {
            return Err(DiscoveryError::UnsupportedBeaconVersion(packet[0]));
        }
        Ok(Self {
            dht_port: u16::from_le_bytes([packet[1], packet[2]]),
        })
    }
}
