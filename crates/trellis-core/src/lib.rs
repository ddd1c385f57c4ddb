//! # Trellis Core
//!
//! The connection-manager core of the Trellis mesh node: connection
//! registry and duplicate arbitration, the versioned peer handshake with
//! its DHT demux shunt, per-family reachability classification with UPnP
//! port mapping, relay coordination, and the anonymity-overlay adapter.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod node;

pub use node::{MeshNode, NodeConfig, NodeError};
