//! Family-aware TCP connect and listen.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::endpoint::{AddressFamily, Endpoint, TransportKind};
use crate::error::{Result, TransportError};
use crate::proxy::{tunnel_through, ProxyConfig};

/// Connect deadline for local-segment peers.
pub const LAN_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Connect deadline for internet peers.
pub const INTERNET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Connect deadline for anonymity-overlay peers.
pub const OVERLAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The connect deadline appropriate for a transport.
#[must_use]
pub fn connect_timeout_for(kind: TransportKind) -> Duration {
    match kind {
        TransportKind::LocalNetwork => LAN_CONNECT_TIMEOUT,
        TransportKind::Ipv4Internet | TransportKind::Ipv6Internet => INTERNET_CONNECT_TIMEOUT,
        TransportKind::AnonymityOverlay => OVERLAY_CONNECT_TIMEOUT,
    }
}

/// Object-safe byte stream, so direct TCP sockets and relay tunnels are
/// interchangeable wherever a peer stream is stored.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug> PeerStream for T {}

/// Plain TCP connect with a deadline. No proxy, no decoy.
///
/// # Errors
///
/// `Unreachable` for connect failures and IP-less endpoints, `Timeout` when
/// the deadline elapses.
pub async fn connect_direct(endpoint: &Endpoint, deadline: Duration) -> Result<TcpStream> {
    let addr = endpoint
        .to_socket_addr()
        .ok_or(TransportError::unreachable("endpoint has no socket address"))?;
    match timeout(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(TransportError::Unreachable(err.to_string().into())),
        Err(_) => Err(TransportError::timeout("tcp connect")),
    }
}

/// Outbound connection factory.
///
/// Selects the concrete mechanism per endpoint: direct TCP for IP endpoints
/// with no proxy configured, the configured HTTP/SOCKS5 proxy otherwise, and
/// the anonymity overlay's SOCKS endpoint for `Unspecified`-family endpoints
/// or when the node runs overlay-only.
#[derive(Clone, Default)]
pub struct Dialer {
    /// Configured egress proxy, if any.
    pub proxy: Option<ProxyConfig>,
    /// SOCKS endpoint of the running overlay controller, if any.
    pub overlay_socks: Option<SocketAddr>,
    /// When set, every outbound connection is pushed through the overlay.
    pub overlay_only: bool,
}

impl Dialer {
    /// Classify an endpoint into the transport it will be dialed over.
    #[must_use]
    pub fn classify(&self, endpoint: &Endpoint) -> TransportKind {
        match endpoint.family() {
            AddressFamily::Unspecified => TransportKind::AnonymityOverlay,
            _ if self.overlay_only => TransportKind::AnonymityOverlay,
            AddressFamily::Ipv4 if endpoint.is_private() => TransportKind::LocalNetwork,
            AddressFamily::Ipv6 if endpoint.is_private() => TransportKind::LocalNetwork,
            AddressFamily::Ipv4 => TransportKind::Ipv4Internet,
            AddressFamily::Ipv6 => TransportKind::Ipv6Internet,
        }
    }

    /// Connect to `endpoint`, honoring the per-transport deadline.
    ///
    /// # Errors
    ///
    /// `Unreachable` without retry on failure; the caller decides.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn PeerStream>> {
        let kind = self.classify(endpoint);
        let deadline = connect_timeout_for(kind);

        match kind {
            TransportKind::AnonymityOverlay => {
                let socks = self
                    .overlay_socks
                    .ok_or(TransportError::unreachable("anonymity overlay is not running"))?;
                let mut stream = timeout(deadline, TcpStream::connect(socks))
                    .await
                    .map_err(|_| TransportError::timeout("overlay socks connect"))?
                    .map_err(|e| TransportError::Unreachable(e.to_string().into()))?;
                timeout(
                    deadline,
                    tunnel_through(&mut stream, crate::proxy::ProxyKind::Socks5, endpoint),
                )
                .await
                .map_err(|_| TransportError::timeout("overlay socks tunnel"))??;
                Ok(Box::new(stream))
            }
            _ => match &self.proxy {
                Some(proxy) => {
                    let mut stream = timeout(deadline, TcpStream::connect(proxy.endpoint))
                        .await
                        .map_err(|_| TransportError::timeout("proxy connect"))?
                        .map_err(|e| TransportError::Unreachable(e.to_string().into()))?;
                    timeout(deadline, tunnel_through(&mut stream, proxy.kind, endpoint))
                        .await
                        .map_err(|_| TransportError::timeout("proxy tunnel"))??;
                    Ok(Box::new(stream))
                }
                None => Ok(Box::new(connect_direct(endpoint, deadline).await?)),
            },
        }
    }
}

/// Bind the peer service listeners for `port`.
///
/// Attempts a single dual-stack socket first (`[::]` with `IPV6_V6ONLY`
/// off); platforms that refuse fall back to two listeners, one per family.
/// With `port == 0` the v4 listener's OS-assigned port is reused for v6.
///
/// # Errors
///
/// Fails only when no listener at all could be bound.
pub async fn listen(port: u16) -> Result<Vec<TcpListener>> {
    use socket2::{Domain, Protocol, Socket, Type};

    let dual = (|| -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_only_v6(false)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let addr: SocketAddr = SocketAddr::new("::".parse().unwrap(), port);
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        Ok(socket.into())
    })();

    if let Ok(std_listener) = dual {
        let listener = TcpListener::from_std(std_listener)?;
        return Ok(vec![listener]);
    }

    // Per-family fallback on the same port.
    let v4 = TcpListener::bind(SocketAddr::new("0.0.0.0".parse().unwrap(), port)).await?;
    let effective_port = v4.local_addr()?.port();
    let mut listeners = vec![v4];

    let v6 = (|| -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_only_v6(true)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let addr: SocketAddr = SocketAddr::new("::".parse().unwrap(), effective_port);
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        Ok(socket.into())
    })();
    match v6 {
        Ok(std_listener) => listeners.push(TcpListener::from_std(std_listener)?),
        Err(err) => tracing::warn!("IPv6 listener unavailable: {err}"),
    }

    Ok(listeners)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_by_kind() {
        assert_eq!(connect_timeout_for(TransportKind::LocalNetwork), LAN_CONNECT_TIMEOUT);
        assert_eq!(
            connect_timeout_for(TransportKind::Ipv4Internet),
            INTERNET_CONNECT_TIMEOUT
        );
        assert_eq!(
            connect_timeout_for(TransportKind::AnonymityOverlay),
            OVERLAY_CONNECT_TIMEOUT
        );
    }

    #[test]
    fn test_classify() {
        let dialer = Dialer::default();
        assert_eq!(
            dialer.classify(&Endpoint::new("192.168.0.5".parse().unwrap(), 1)),
            TransportKind::LocalNetwork
        );
        assert_eq!(
            dialer.classify(&Endpoint::new("203.0.113.5".parse().unwrap(), 1)),
            TransportKind::Ipv4Internet
        );
        assert_eq!(
            dialer.classify(&Endpoint::new("2001:db8::1".parse().unwrap(), 1)),
            TransportKind::Ipv6Internet
        );
        assert_eq!(
            dialer.classify(&Endpoint::domain("peer.onion", 1)),
            TransportKind::AnonymityOverlay
        );

        let overlay_only = Dialer { overlay_only: true, ..Dialer::default() };
        assert_eq!(
            overlay_only.classify(&Endpoint::new("203.0.113.5".parse().unwrap(), 1)),
            TransportKind::AnonymityOverlay
        );
    }

    #[tokio::test]
    async fn test_listen_and_connect_loopback() {
        let listeners = listen(0).await.unwrap();
        let addr = listeners[0].local_addr().unwrap();
        let port = addr.port();

        let accept = tokio::spawn(async move {
            let (stream, _) = listeners[0].accept().await.unwrap();
            stream
        });

        let target = Endpoint::new("127.0.0.1".parse().unwrap(), port);
        let _client = connect_direct(&target, LAN_CONNECT_TIMEOUT).await.unwrap();
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        // Bind then drop to get a port that is very likely closed.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let target = Endpoint::new("127.0.0.1".parse().unwrap(), port);
        let err = connect_direct(&target, LAN_CONNECT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_overlay_endpoint_without_socks_is_unreachable() {
        let dialer = Dialer::default();
        let err = dialer
            .connect(&Endpoint::domain("peer.onion", 41700))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
