//! Error types for the connection-manager core.

use std::borrow::Cow;
use thiserror::Error;
use trellis_discovery::DiscoveryError;
use trellis_transport::TransportError;

/// Errors surfaced by node operations.
///
/// Background loops (accept, receive, watchers, timers) never propagate
/// these; they log and continue. Synchronous operations invoked by the
/// application surface them to the caller.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The dialed endpoint answered with our own peer id.
    #[error("connected to self")]
    SelfConnection,

    /// A virtual connection lost arbitration against an existing record.
    #[error("duplicate virtual connection")]
    DuplicateVirtual,

    /// A real connection lost arbitration against an existing record.
    #[error("duplicate real connection")]
    DuplicateReal,

    /// Arbitration reported a duplicate but no surviving record was found.
    #[error("duplicate connection could not be reconciled")]
    DuplicateNotReconciled,

    /// The peer cancelled our handshake and no winning record appeared.
    #[error("handshake rejected as duplicate")]
    DuplicateRejected,

    /// Another connect to the same endpoint is already in flight.
    #[error("connection attempt already in progress")]
    ConnectInProgress,

    /// The peer broke the handshake byte sequence.
    #[error("bad handshake: {0}")]
    BadHandshake(Cow<'static, str>),

    /// The peer opened with a version byte we do not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),

    /// The target object has been disposed.
    #[error("disposed")]
    Disposed,

    /// Operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Operation deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// UPnP gateway interaction failed.
    #[error("UPnP failure: {0}")]
    Upnp(String),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Discovery-level failure.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl NodeError {
    /// Bad handshake with a static context.
    #[must_use]
    pub const fn bad_handshake(context: &'static str) -> Self {
        Self::BadHandshake(Cow::Borrowed(context))
    }

    /// Timeout with a static context.
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        Self::Timeout(Cow::Borrowed(context))
    }

    /// Invalid state with a static context.
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        Self::InvalidState(Cow::Borrowed(context))
    }

    /// True for the duplicate-arbitration outcomes that leave an existing
    /// record in place.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateVirtual | Self::DuplicateReal)
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
