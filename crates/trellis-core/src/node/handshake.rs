//! The versioned peer handshake.
//!
//! Every peer stream (after the HTTP decoy, where one applies) begins with a
//! version byte. Version 0 is the demux shunt: the stream is reassigned to
//! the DHT handler for its transport, letting one TCP port carry both the
//! DHT channel and the peer protocol. Version 1 is the peer handshake:
//!
//! ```text
//! Client -> Server: 0x01  PeerId[32]  Port[u16 LE]
//! Server -> Client: {0x00|0x01}  PeerId[32]
//! ```
//!
//! `0x00` accepts; `0x01` cancels (duplicate). Both sides may initiate to
//! each other simultaneously; the cancelled side resolves to the winning
//! record through a delayed registry lookup.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use trellis_discovery::{DhtManager, DhtNode};
use trellis_transport::{DeadlineStream, Endpoint, PeerId, PeerStream};

use super::connection::{Connection, PERSISTENT_READ_TIMEOUT, PERSISTENT_WRITE_TIMEOUT};
use super::error::{NodeError, Result};
use super::registry::{ConnectionRegistry, InsertOutcome};

/// Peer protocol version carried by the handshake.
pub const PROTOCOL_VERSION: u8 = 1;
/// Version byte that diverts the stream to the DHT handler.
pub const DHT_SHUNT_VERSION: u8 = trellis_discovery::DHT_CHANNEL_SHUNT;

const RESPONSE_ACCEPT: u8 = 0;
const RESPONSE_CANCEL: u8 = 1;

/// Grace period before the cancelled side of a crossed connect looks up the
/// winning record: long enough, in practice, for the peer-initiated
/// handshake on the other socket to finish its registry insert here. The
/// lookup is what carries correctness; the delay is a heuristic.
const CANCEL_RESOLVE_DELAY: Duration = Duration::from_millis(500);

/// Apply the persistent per-operation deadlines an established peer stream
/// runs under for the rest of its life.
fn with_persistent_deadlines(stream: Box<dyn PeerStream>) -> Box<dyn PeerStream> {
    Box::new(DeadlineStream::new(
        stream,
        PERSISTENT_READ_TIMEOUT,
        PERSISTENT_WRITE_TIMEOUT,
    ))
}

/// Where version-0 streams for a given listener go.
#[derive(Clone)]
pub enum DhtDispatch {
    /// Internet listener: route by the remote's address family.
    Internet(DhtManager),
    /// Local-segment listener: the segment's own DHT node.
    Local(DhtNode),
}

/// Shared state both handshake directions need.
pub struct HandshakeContext {
    /// The connection registry
    pub registry: Arc<ConnectionRegistry>,
    /// Our own peer id
    pub local_peer: PeerId,
    /// Our advertised TCP service port
    pub local_port: u16,
}

/// Client side: initiate the handshake on a freshly connected stream.
///
/// On accept, the stream is placed under the persistent read/write
/// deadlines and the connection is registered (or reconciled against an
/// existing record). On cancel, waits out [`CANCEL_RESOLVE_DELAY`] and
/// resolves to the record the peer's crossing handshake inserted.
///
/// # Errors
///
/// `SelfConnection` when the responder is ourselves, `DuplicateRejected`
/// when a cancel could not be reconciled, `BadHandshake` on wire garbage.
pub async fn initiate(
    mut stream: Box<dyn PeerStream>,
    remote: Endpoint,
    ctx: &HandshakeContext,
    is_virtual: bool,
) -> Result<Arc<Connection>> {
    let mut request = Vec::with_capacity(35);
    request.push(PROTOCOL_VERSION);
    request.extend_from_slice(ctx.local_peer.as_bytes());
    request.extend_from_slice(&ctx.local_port.to_le_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut response = [0u8; 33];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|_| NodeError::bad_handshake("peer closed during response"))?;
    let code = response[0];
    let mut id = [0u8; 32];
    id.copy_from_slice(&response[1..]);
    let remote_peer = PeerId::from_bytes(id);

    if remote_peer == ctx.local_peer {
        return Err(NodeError::SelfConnection);
    }

    match code {
        RESPONSE_ACCEPT => {
            let stream = with_persistent_deadlines(stream);
            let candidate = Connection::new(remote_peer, remote.clone(), is_virtual, Some(stream));
            match ctx.registry.insert(&candidate) {
                InsertOutcome::Inserted { displaced } => {
                    for old in displaced {
                        old.close();
                    }
                    tracing::debug!(peer = %remote_peer, endpoint = %remote, "connection established");
                    Ok(candidate)
                }
                InsertOutcome::DuplicateVirtual | InsertOutcome::DuplicateReal => {
                    candidate.close();
                    lookup_existing(&ctx.registry, &remote, &remote_peer)
                        .ok_or(NodeError::DuplicateNotReconciled)
                }
                InsertOutcome::SelfConnection => {
                    candidate.close();
                    Err(NodeError::SelfConnection)
                }
            }
        }
        RESPONSE_CANCEL => {
            drop(stream);
            tokio::time::sleep(CANCEL_RESOLVE_DELAY).await;
            lookup_existing(&ctx.registry, &remote, &remote_peer).ok_or(NodeError::DuplicateRejected)
        }
        other => Err(NodeError::BadHandshake(
            format!("unexpected response code {other:#04x}").into(),
        )),
    }
}

/// Server side: classify and answer an accepted stream.
///
/// Version-0 streams are handed to the DHT per `dispatch` and yield
/// `Ok(None)`. Version-1 streams run insert arbitration; winners are
/// answered with accept, placed under the persistent deadlines, and
/// returned; losers are answered with cancel and reported as the duplicate
/// error.
///
/// # Errors
///
/// Duplicate outcomes, `SelfConnection`, and
/// `UnsupportedProtocolVersion` for any other leading byte.
pub async fn accept(
    mut stream: Box<dyn PeerStream>,
    remote: Endpoint,
    ctx: &HandshakeContext,
    dispatch: &DhtDispatch,
    is_virtual: bool,
) -> Result<Option<Arc<Connection>>> {
    let mut version = [0u8; 1];
    stream
        .read_exact(&mut version)
        .await
        .map_err(|_| NodeError::bad_handshake("peer closed before version byte"))?;

    match version[0] {
        DHT_SHUNT_VERSION => {
            match dispatch {
                DhtDispatch::Internet(manager) => {
                    manager.accept_internet_dht_connection(stream, remote)?;
                }
                DhtDispatch::Local(node) => {
                    let node = node.clone();
                    tokio::spawn(async move {
                        node.serve_stream(stream, remote).await;
                    });
                }
            }
            Ok(None)
        }
        PROTOCOL_VERSION => {
            let mut hello = [0u8; 34];
            stream
                .read_exact(&mut hello)
                .await
                .map_err(|_| NodeError::bad_handshake("peer closed during hello"))?;
            let mut id = [0u8; 32];
            id.copy_from_slice(&hello[..32]);
            let remote_peer = PeerId::from_bytes(id);
            let service_port = u16::from_le_bytes([hello[32], hello[33]]);

            // The inbound ephemeral port is not a reachable address; store
            // the peer's advertised service port instead.
            let remote = remote.with_port(service_port);

            let candidate = Connection::new(remote_peer, remote.clone(), is_virtual, None);
            match ctx.registry.insert(&candidate) {
                InsertOutcome::Inserted { displaced } => {
                    for old in displaced {
                        old.close();
                    }
                    if let Err(err) = write_response(&mut stream, RESPONSE_ACCEPT, ctx).await {
                        ctx.registry.remove(&candidate);
                        candidate.close();
                        return Err(err);
                    }
                    candidate.attach_stream(with_persistent_deadlines(stream));
                    tracing::debug!(peer = %remote_peer, endpoint = %remote, "inbound connection established");
                    Ok(Some(candidate))
                }
                InsertOutcome::SelfConnection => {
                    let _ = write_response(&mut stream, RESPONSE_CANCEL, ctx).await;
                    Err(NodeError::SelfConnection)
                }
                InsertOutcome::DuplicateVirtual => {
                    let _ = write_response(&mut stream, RESPONSE_CANCEL, ctx).await;
                    Err(NodeError::DuplicateVirtual)
                }
                InsertOutcome::DuplicateReal => {
                    let _ = write_response(&mut stream, RESPONSE_CANCEL, ctx).await;
                    Err(NodeError::DuplicateReal)
                }
            }
        }
        other => Err(NodeError::UnsupportedProtocolVersion(other)),
    }
}

async fn write_response(
    stream: &mut Box<dyn PeerStream>,
    code: u8,
    ctx: &HandshakeContext,
) -> Result<()> {
    let mut response = Vec::with_capacity(33);
    response.push(code);
    response.extend_from_slice(ctx.local_peer.as_bytes());
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

fn lookup_existing(
    registry: &ConnectionRegistry,
    endpoint: &Endpoint,
    peer: &PeerId,
) -> Option<Arc<Connection>> {
    registry
        .get_by_endpoint(endpoint)
        .or_else(|| registry.get_by_peer(peer))
        .filter(|conn| !conn.is_disposed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::sync::mpsc;
    use trellis_discovery::DhtConfig;

    fn context() -> HandshakeContext {
        let local_peer = PeerId::random();
        HandshakeContext {
            registry: Arc::new(ConnectionRegistry::new(local_peer)),
            local_peer,
            local_port: 41700,
        }
    }

    fn internet_dispatch() -> DhtDispatch {
        let (tx, _rx) = mpsc::channel(1);
        let config = DhtConfig { enable_local_discovery: false, ..DhtConfig::default() };
        DhtDispatch::Internet(DhtManager::new(config, tx))
    }

    fn ep(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse().unwrap(), port)
    }

    #[tokio::test]
    async fn test_initiate_accept_pair() {
        let client_ctx = context();
        let server_ctx = context();
        let dispatch = internet_dispatch();

        let (client_stream, server_stream) = duplex(4096);
        let client_remote = ep("203.0.113.2", 41700);
        let server_remote = ep("203.0.113.1", 55123);

        let server = tokio::spawn(async move {
            accept(Box::new(server_stream), server_remote, &server_ctx, &dispatch, false)
                .await
                .map(|conn| (conn, server_ctx))
        });

        let conn = initiate(Box::new(client_stream), client_remote.clone(), &client_ctx, false)
            .await
            .unwrap();

        let (server_conn, server_ctx) = server.await.unwrap().unwrap();
        let server_conn = server_conn.expect("peer connection, not a DHT stream");

        assert_eq!(conn.peer_id(), server_ctx.local_peer);
        assert_eq!(server_conn.peer_id(), client_ctx.local_peer);
        // Ephemeral source port rewritten to the advertised service port.
        assert_eq!(server_conn.remote_endpoint().port(), 41700);
        assert_eq!(client_ctx.registry.len(), 1);
        assert_eq!(server_ctx.registry.len(), 1);

        // Both records run under the persistent deadlines.
        assert_eq!(conn.read_timeout(), PERSISTENT_READ_TIMEOUT);
        assert_eq!(conn.write_timeout(), PERSISTENT_WRITE_TIMEOUT);
        assert_eq!(server_conn.read_timeout(), PERSISTENT_READ_TIMEOUT);

        // The deadline wrapper passes peer-protocol bytes through unchanged.
        let mut client_stream = conn.take_stream().unwrap();
        let mut server_stream = server_conn.take_stream().unwrap();
        client_stream.write_all(&[0xAB, 0xCD]).await.unwrap();
        client_stream.flush().await.unwrap();
        let mut payload = [0u8; 2];
        server_stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, [0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn test_self_connect_rejected_both_sides() {
        let ctx = context();
        let dispatch = internet_dispatch();
        let (client_stream, server_stream) = duplex(4096);

        let server_ctx = HandshakeContext {
            registry: Arc::clone(&ctx.registry),
            local_peer: ctx.local_peer,
            local_port: ctx.local_port,
        };
        let server = tokio::spawn(async move {
            accept(
                Box::new(server_stream),
                ep("203.0.113.1", 50000),
                &server_ctx,
                &dispatch,
                false,
            )
            .await
        });

        let err = initiate(Box::new(client_stream), ep("203.0.113.1", 41700), &ctx, false)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::SelfConnection));

        let server_err = server.await.unwrap().unwrap_err();
        assert!(matches!(server_err, NodeError::SelfConnection));
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_shunt_byte_diverts_to_dht() {
        let ctx = context();
        let dispatch = internet_dispatch();
        let (mut client_stream, server_stream) = duplex(4096);

        tokio::spawn(async move {
            client_stream.write_all(&[DHT_SHUNT_VERSION]).await.unwrap();
            // Keep the stream open long enough for dispatch.
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let result = accept(
            Box::new(server_stream),
            ep("203.0.113.1", 50000),
            &ctx,
            &dispatch,
            false,
        )
        .await
        .unwrap();
        assert!(result.is_none());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let ctx = context();
        let dispatch = internet_dispatch();
        let (mut client_stream, server_stream) = duplex(4096);

        tokio::spawn(async move {
            client_stream.write_all(&[9]).await.unwrap();
        });

        let err = accept(
            Box::new(server_stream),
            ep("203.0.113.1", 50000),
            &ctx,
            &dispatch,
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::UnsupportedProtocolVersion(9)));
    }

    #[tokio::test]
    async fn test_cancel_resolves_to_existing_record() {
        let ctx = context();
        let peer = PeerId::random();
        let endpoint = ep("203.0.113.2", 41700);

        // Fake peer: answers cancel. The crossing handshake's record shows
        // up while we sleep.
        let (client_stream, mut peer_stream) = duplex(4096);
        let peer_task = tokio::spawn(async move {
            let mut hello = [0u8; 35];
            peer_stream.read_exact(&mut hello).await.unwrap();
            let mut response = vec![RESPONSE_CANCEL];
            response.extend_from_slice(peer.as_bytes());
            peer_stream.write_all(&response).await.unwrap();
            peer_stream
        });

        let registry = Arc::clone(&ctx.registry);
        let winner = Connection::new(peer, endpoint.clone(), false, None);
        let insert_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            registry.insert(&winner);
        });

        let resolved = initiate(Box::new(client_stream), endpoint, &ctx, false)
            .await
            .unwrap();
        assert_eq!(resolved.peer_id(), peer);

        peer_task.await.unwrap();
        insert_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_without_winner_is_rejected() {
        let ctx = context();
        let peer = PeerId::random();
        let (client_stream, mut peer_stream) = duplex(4096);

        tokio::spawn(async move {
            let mut hello = [0u8; 35];
            peer_stream.read_exact(&mut hello).await.unwrap();
            let mut response = vec![RESPONSE_CANCEL];
            response.extend_from_slice(peer.as_bytes());
            peer_stream.write_all(&response).await.unwrap();
            peer_stream
        });

        let err = initiate(Box::new(client_stream), ep("203.0.113.2", 41700), &ctx, false)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::DuplicateRejected));
    }

    #[tokio::test]
    async fn test_garbage_response_is_bad_handshake() {
        let ctx = context();
        let (client_stream, mut peer_stream) = duplex(4096);

        tokio::spawn(async move {
            let mut hello = [0u8; 35];
            peer_stream.read_exact(&mut hello).await.unwrap();
            peer_stream.write_all(&[0x7F; 33]).await.unwrap();
        });

        let err = initiate(Box::new(client_stream), ep("203.0.113.2", 41700), &ctx, false)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::BadHandshake(_)));
    }
}
