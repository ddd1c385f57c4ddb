//! # Trellis Transport
//!
//! Transport primitives for the Trellis mesh node:
//!
//! - Family-tagged endpoints with canonical normalization
//! - Family-aware TCP connect/listen with per-transport deadlines
//! - HTTP decoy framing for peer streams
//! - HTTP CONNECT and SOCKS5 tunnel clients
//! - Deadline-enforcing wrapper for established peer streams

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoy;
pub mod endpoint;
pub mod error;
pub mod proxy;
pub mod stream;
pub mod tcp;

pub use decoy::{exchange_decoy, DecoyRole};
pub use endpoint::{AddressFamily, Endpoint, NetworkId, PeerId, TransportKind};
pub use error::{Result, TransportError};
pub use proxy::{ProxyConfig, ProxyKind};
pub use stream::DeadlineStream;
pub use tcp::{
    connect_direct, connect_timeout_for, listen, Dialer, PeerStream, INTERNET_CONNECT_TIMEOUT,
    LAN_CONNECT_TIMEOUT, OVERLAY_CONNECT_TIMEOUT,
};
