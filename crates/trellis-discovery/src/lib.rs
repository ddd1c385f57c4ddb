//! # Trellis Discovery
//!
//! Peer discovery for the Trellis mesh node:
//!
//! - Transport-scoped DHT node handles and their TCP-channel protocol
//! - Local-segment beaconing and per-interface discovery managers
//! - The DHT manager: bootstrap, fan-out find/announce, network watcher

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod beacon;
pub mod bootstrap;
pub mod dht;
pub mod error;
pub mod local;
pub mod manager;

pub use beacon::{Beacon, BEACON_VERSION, DISCOVERY_PORT, IPV6_MULTICAST_GROUP};
pub use bootstrap::{encode_bootstrap_blob, fetch_bootstrap_endpoints, parse_bootstrap_blob};
pub use dht::{DhtConnector, DhtMessage, DhtNode, DhtPeer, DHT_CHANNEL_SHUNT};
pub use error::{DiscoveryError, Result};
pub use local::{LocalInbound, LocalNetworkDhtManager, NetworkInterfaceRecord};
pub use manager::{
    live_interface_records, plan_interface_changes, DhtConfig, DhtManager, DiscoveryCallback,
    OverlayDhtConfig, ShuntConnector,
};
