//! Transport error types.

use std::borrow::Cow;
use thiserror::Error;

/// Errors produced by the transport primitives.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The endpoint could not be reached. Connect failures are final;
    /// the caller decides whether to retry.
    #[error("endpoint unreachable: {0}")]
    Unreachable(Cow<'static, str>),

    /// The operation did not complete within its deadline.
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// The peer closed the stream before the HTTP decoy exchange finished.
    #[error("HTTP decoy aborted before completion")]
    DecoyAborted,

    /// The proxy rejected or mangled the tunnel handshake.
    #[error("proxy handshake failed: {0}")]
    Proxy(Cow<'static, str>),

    /// A wire artifact failed to parse.
    #[error("malformed data: {0}")]
    Malformed(Cow<'static, str>),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Unreachable with a static context.
    #[must_use]
    pub const fn unreachable(context: &'static str) -> Self {
        Self::Unreachable(Cow::Borrowed(context))
    }

    /// Timeout with a static context.
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        Self::Timeout(Cow::Borrowed(context))
    }

    /// Malformed with a static context.
    #[must_use]
    pub const fn malformed(context: &'static str) -> Self {
        Self::Malformed(Cow::Borrowed(context))
    }

    /// Proxy failure with a static context.
    #[must_use]
    pub const fn proxy(context: &'static str) -> Self {
        Self::Proxy(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
