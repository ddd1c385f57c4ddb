//! Outbound proxy clients.
//!
//! Hand-rolled HTTP CONNECT and SOCKS5 (RFC 1928, no-auth subset) tunnel
//! handshakes. Both run over an already-connected stream so the same code
//! serves a configured egress proxy and the anonymity overlay's SOCKS
//! endpoint.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// Proxy protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// HTTP CONNECT proxy
    Http,
    /// SOCKS5 proxy
    Socks5,
}

/// A configured egress proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy protocol
    pub kind: ProxyKind,
    /// Proxy listener address
    pub endpoint: SocketAddr,
}

impl ProxyConfig {
    /// HTTP CONNECT proxy at `endpoint`.
    #[must_use]
    pub const fn http(endpoint: SocketAddr) -> Self {
        Self { kind: ProxyKind::Http, endpoint }
    }

    /// SOCKS5 proxy at `endpoint`.
    #[must_use]
    pub const fn socks5(endpoint: SocketAddr) -> Self {
        Self { kind: ProxyKind::Socks5, endpoint }
    }
}

/// Run the tunnel handshake for `target` over `stream`.
///
/// # Errors
///
/// `Proxy` when the proxy refuses the method or the tunnel,
/// `Unreachable` when the proxy reports the target down.
pub async fn tunnel_through<S>(stream: &mut S, kind: ProxyKind, target: &Endpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match kind {
        ProxyKind::Http => http_connect(stream, target).await,
        ProxyKind::Socks5 => socks5_connect(stream, target).await,
    }
}

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_METHOD_NONE: u8 = 0x00;
const SOCKS_METHOD_UNACCEPTABLE: u8 = 0xFF;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_V4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_V6: u8 = 0x04;
const SOCKS_REPLY_SUCCESS: u8 = 0x00;

async fn socks5_connect<S>(stream: &mut S, target: &Endpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation: offer no-auth only.
    stream
        .write_all(&[SOCKS_VERSION, 1, SOCKS_METHOD_NONE])
        .await?;
    stream.flush().await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != SOCKS_VERSION {
        return Err(TransportError::proxy("SOCKS server spoke wrong version"));
    }
    if method[1] == SOCKS_METHOD_UNACCEPTABLE || method[1] != SOCKS_METHOD_NONE {
        return Err(TransportError::proxy("SOCKS server rejected no-auth method"));
    }

    // CONNECT request.
    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match target {
        Endpoint::V4(ip, port) => {
            request.push(SOCKS_ATYP_V4);
            request.extend_from_slice(&ip.octets());
            request.extend_from_slice(&port.to_be_bytes());
        }
        Endpoint::V6(ip, port) => {
            request.push(SOCKS_ATYP_V6);
            request.extend_from_slice(&ip.octets());
            request.extend_from_slice(&port.to_be_bytes());
        }
        Endpoint::Domain(host, port) => {
            if host.len() > u8::MAX as usize {
                return Err(TransportError::malformed("domain too long for SOCKS5"));
            }
            request.push(SOCKS_ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
            request.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&request).await?;
    stream.flush().await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(TransportError::proxy("SOCKS reply spoke wrong version"));
    }
    if head[1] != SOCKS_REPLY_SUCCESS {
        return Err(TransportError::Unreachable(
            format!("SOCKS CONNECT failed with code {:#04x}", head[1]).into(),
        ));
    }

    // Drain the bound address so the stream is positioned at tunnel data.
    let addr_len = match head[3] {
        SOCKS_ATYP_V4 => 4usize,
        SOCKS_ATYP_V6 => 16,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(TransportError::proxy("SOCKS reply carried unknown address type")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn http_connect<S>(stream: &mut S, target: &Endpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = format!("{}:{}", target.host_string(), target.port());
    let request = format!("CONNECT {host} HTTP/1.1\r\nHost: {host}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read the response head up to the blank line.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::proxy("proxy closed during CONNECT"));
        }
        head.push(byte[0]);
        if head.len() > 4096 {
            return Err(TransportError::proxy("oversized CONNECT response"));
        }
    }

    let status_line = head.split(|&b| b == b'\r').next().unwrap_or(&[]);
    let status_line = String::from_utf8_lossy(status_line);
    let mut parts = status_line.split_whitespace();
    let _version = parts.next();
    match parts.next() {
        Some("200") => Ok(()),
        Some(code) => Err(TransportError::Unreachable(
            format!("proxy CONNECT answered {code}").into(),
        )),
        None => Err(TransportError::proxy("malformed CONNECT status line")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_socks5_connect_v4() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::new("203.0.113.5".parse().unwrap(), 443);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..4], &[0x05, 0x01, 0x00, 0x01]);
            assert_eq!(&req[4..8], &[203, 0, 113, 5]);
            assert_eq!(u16::from_be_bytes([req[8], req[9]]), 443);

            // Success reply bound to 0.0.0.0:0.
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        socks5_connect(&mut client, &target).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_connect_domain_refused() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::domain("peer.onion", 41700);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = vec![0u8; 4 + 1 + "peer.onion".len() + 2];
            server.read_exact(&mut req).await.unwrap();
            // Host unreachable.
            server
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = socks5_connect(&mut client, &target).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_socks5_no_acceptable_method() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::new("203.0.113.5".parse().unwrap(), 443);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let err = socks5_connect(&mut client, &target).await.unwrap_err();
        assert!(matches!(err, TransportError::Proxy(_)));
    }

    #[tokio::test]
    async fn test_http_connect_ok() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::new("203.0.113.5".parse().unwrap(), 8443);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(req.starts_with("CONNECT 203.0.113.5:8443 HTTP/1.1\r\n"));
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        http_connect(&mut client, &target).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_forbidden() {
        let (mut client, mut server) = duplex(1024);
        let target = Endpoint::new("203.0.113.5".parse().unwrap(), 8443);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
        });

        let err = http_connect(&mut client, &target).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
