//! Connection-manager core of the Trellis mesh node.
//!
//! Coordinates the pieces a node needs to stay connected:
//!
//! - [`registry`] - dedup tables and insert arbitration
//! - [`handshake`] - the versioned initiate/accept sequence and DHT demux
//! - [`connection`] - connection records and in-flight coalescing
//! - [`reachability`] - per-family connectivity classification and UPnP
//! - [`relay`] - relay-client pool and hosted-network registry
//! - [`overlay`] - the anonymity-overlay controller adapter
//! - [`node`] - the `MeshNode` orchestration layer
//!
//! ```no_run
//! use trellis_core::node::{MeshNode, NodeConfig};
//! use trellis_transport::Endpoint;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = MeshNode::new(NodeConfig::default());
//!     node.start().await?;
//!
//!     let peer = Endpoint::new("203.0.113.9".parse()?, 41700);
//!     let connection = node.make_connection(&peer).await?;
//!     println!("connected to {}", connection.peer_id());
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
#[allow(clippy::module_inception)]
pub mod node;
pub mod overlay;
pub mod probes;
pub mod reachability;
pub mod registry;
pub mod relay;
pub mod upnp;

pub use config::{ConnectivityConfig, NodeConfig, OverlayConfig, OverlayMode, RelayConfig};
pub use connection::{
    Connection, InFlightTable, PERSISTENT_READ_TIMEOUT, PERSISTENT_WRITE_TIMEOUT,
};
pub use error::{NodeError, Result};
pub use handshake::{DhtDispatch, HandshakeContext, DHT_SHUNT_VERSION, PROTOCOL_VERSION};
pub use node::MeshNode;
pub use overlay::OverlayAdapter;
pub use probes::{ConnectivityProbe, WebProbe};
pub use reachability::{
    FamilyState, InterfaceSource, ReachabilityMonitor, ReachabilityStatus, SystemInterfaceSource,
    UpnpStatus,
};
pub use registry::{allow_new_connection, ConnectionRegistry, InsertOutcome};
pub use relay::{RelayCoordinator, TunnelDialer};
pub use upnp::{IgdProvider, UpnpGateway, UpnpProvider};
