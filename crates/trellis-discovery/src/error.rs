//! Discovery error types.

use std::borrow::Cow;
use thiserror::Error;
use trellis_transport::TransportError;

/// Errors produced by the discovery layer.
#[derive(Debug, Error, Clone)]
pub enum DiscoveryError {
    /// Beacon packet carried an unknown version byte.
    #[error("unsupported beacon version {0}")]
    UnsupportedBeaconVersion(u8),

    /// Beacon packet was shorter than the fixed frame.
    #[error("truncated beacon packet ({0} bytes)")]
    TruncatedBeacon(usize),

    /// A stream or endpoint belongs to no known address family.
    #[error("unsupported address family")]
    UnsupportedFamily,

    /// A DHT channel message failed to parse.
    #[error("malformed DHT message: {0}")]
    MalformedMessage(Cow<'static, str>),

    /// A DHT query did not answer within its deadline.
    #[error("DHT query timed out")]
    QueryTimeout,

    /// Bootstrap blob fetch or parse failure.
    #[error("bootstrap failed: {0}")]
    Bootstrap(Cow<'static, str>),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl DiscoveryError {
    /// Malformed message with static context.
    #[must_use]
    pub const fn malformed(context: &'static str) -> Self {
        Self::MalformedMessage(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
