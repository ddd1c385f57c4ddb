//! DHT channel message definitions.
//!
//! The DHT protocol rides TCP channels: the peer service port behind the
//! version-0 shunt on the internet transports, and plain per-interface TCP
//! on local segments. Messages are bincode-encoded and length-prefixed with
//! a `u16` little-endian.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use trellis_transport::{Endpoint, NetworkId};

use crate::error::{DiscoveryError, Result};

/// Hard cap on an encoded DHT message.
pub const MAX_MESSAGE_LEN: usize = 8 * 1024;

/// Leading byte that diverts an accepted peer stream to the DHT handler.
/// Carries no payload; the channel protocol follows immediately.
pub const DHT_CHANNEL_SHUNT: u8 = 0;

/// Messages exchanged over a DHT channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DhtMessage {
    /// Liveness probe
    Ping,

    /// Liveness answer
    Pong,

    /// Ask for peers announced under a network
    FindPeers {
        /// Network being searched
        network: NetworkId,
    },

    /// Peers announced under a network
    Peers {
        /// Network the result belongs to
        network: NetworkId,
        /// Announced peer service endpoints
        endpoints: Vec<Endpoint>,
    },

    /// Publish own service endpoint under a network
    Announce {
        /// Network being joined
        network: NetworkId,
        /// The announcer's service endpoint; an unspecified IP is
        /// substituted with the observed source address by the receiver
        endpoint: Endpoint,
    },

    /// Ask for DHT nodes close to a key
    FindNode {
        /// Target key
        target: [u8; 32],
    },

    /// DHT node endpoints close to a requested key
    Nodes {
        /// Known node endpoints
        endpoints: Vec<Endpoint>,
    },
}

/// Write one length-prefixed message.
///
/// # Errors
///
/// I/O failures, or `MalformedMessage` when the payload exceeds
/// [`MAX_MESSAGE_LEN`].
pub async fn write_message<S>(stream: &mut S, message: &DhtMessage) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(message)
        .map_err(|e| DiscoveryError::MalformedMessage(e.to_string().into()))?;
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(DiscoveryError::malformed("message exceeds frame cap"));
    }
    let len = (payload.len() as u16).to_le_bytes();
    stream.write_all(&len).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// # Errors
///
/// I/O failures, oversized frames, or undecodable payloads.
pub async fn read_message<S>(stream: &mut S) -> Result<DhtMessage>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let len = u16::from_le_bytes(len) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(DiscoveryError::malformed("frame length exceeds cap"));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    bincode::deserialize(&payload)
        .map_err(|e| DiscoveryError::MalformedMessage(e.to_string().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_roundtrip_over_stream() {
        let (mut a, mut b) = duplex(4096);
        let network = NetworkId::from_bytes([7u8; 32]);
        let msg = DhtMessage::Peers {
            network,
            endpoints: vec![
                Endpoint::new("203.0.113.4".parse().unwrap(), 41700),
                Endpoint::domain("peer.onion", 41700),
            ],
        };

        write_message(&mut a, &msg).await.unwrap();
        let decoded = read_message(&mut b).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (mut a, mut b) = duplex(4096);
        write_message(&mut a, &DhtMessage::Ping).await.unwrap();
        write_message(&mut a, &DhtMessage::Pong).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), DhtMessage::Ping);
        assert_eq!(read_message(&mut b).await.unwrap(), DhtMessage::Pong);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = duplex(usize::from(u16::MAX) + 8);
        let len = (u16::MAX).to_le_bytes();
        a.write_all(&len).await.unwrap();
        a.write_all(&vec![0u8; u16::MAX as usize]).await.unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedMessage(_)));
    }
}
