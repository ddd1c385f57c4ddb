//! Relay coordination.
//!
//! Client side: a periodic fill keeps at most three outbound connections to
//! remote relays, so a NAT-trapped node stays reachable through them.
//! Server side: a registry of hosted networks this node relays for, with an
//! announce into the IPv4 DHT so prospective peers can find the relay.
//!
//! The coordinator holds the strong references that keep a connection alive
//! as a relay; disposal unregisters the connection from every table before
//! its stream closes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use trellis_discovery::DhtManager;
use trellis_transport::{Endpoint, NetworkId, PeerStream};

use super::config::RelayConfig;
use super::connection::Connection;
use super::error::Result;

/// Opens a tunneled stream to `target` through an established relay
/// connection. The tunnel-request framing is part of the application
/// protocol; the mesh application supplies the implementation.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// Request a tunnel to `target` over `relay` and return the stream.
    async fn open_tunnel(
        &self,
        relay: &Arc<Connection>,
        target: &Endpoint,
    ) -> Result<Box<dyn PeerStream>>;
}

struct RelayInner {
    max_clients: usize,
    clients: Mutex<Vec<Arc<Connection>>>,
    hosted: Mutex<HashMap<NetworkId, Vec<Arc<Connection>>>>,
}

/// Client-side relay pool and server-side hosted-network registry.
#[derive(Clone)]
pub struct RelayCoordinator {
    inner: Arc<RelayInner>,
}

impl RelayCoordinator {
    /// New coordinator bounded by `config.max_relay_clients`.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                max_clients: config.max_relay_clients,
                clients: Mutex::new(Vec::new()),
                hosted: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// How many relay clients the fill timer still wants.
    #[must_use]
    pub fn client_deficit(&self) -> usize {
        let clients = self.inner.clients.lock().unwrap();
        self.inner.max_clients.saturating_sub(clients.len())
    }

    /// Current relay-client count.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    /// Atomically adopt a freshly dialed connection as a relay client.
    ///
    /// Returns false when the pool filled up while the dial was in flight
    /// (the over-capacity win is discarded) or the connection is already a
    /// member. On success the connection is flagged relay-client mode.
    pub fn try_adopt_client(&self, connection: &Arc<Connection>) -> bool {
        let mut clients = self.inner.clients.lock().unwrap();
        if clients.len() >= self.inner.max_clients {
            return false;
        }
        if clients.iter().any(|c| Arc::ptr_eq(c, connection)) {
            return false;
        }
        clients.push(Arc::clone(connection));
        drop(clients);
        connection.set_relay_client_mode(true);
        true
    }

    /// Register `connection` as a relay consumer for `network` and announce
    /// this node as a relay for it.
    ///
    /// Registration is deduplicated on connection identity.
    pub fn register_hosted_network(
        &self,
        network: NetworkId,
        connection: &Arc<Connection>,
        dht: &DhtManager,
        local_port: u16,
    ) {
        {
            let mut hosted = self.inner.hosted.lock().unwrap();
            let members = hosted.entry(network).or_default();
            if members.iter().any(|c| Arc::ptr_eq(c, connection)) {
                return;
            }
            members.push(Arc::clone(connection));
        }
        tracing::debug!(network = %network, "hosting relay for network");
        // Receivers substitute the unspecified address with the observed
        // source IP, so the announced endpoint is (0.0.0.0, service port).
        dht.begin_announce(
            network,
            false,
            Endpoint::V4(Ipv4Addr::UNSPECIFIED, local_port),
            Arc::new(|_, _| {}),
        );
    }

    /// Networks currently hosted.
    #[must_use]
    pub fn hosted_network_count(&self) -> usize {
        self.inner.hosted.lock().unwrap().len()
    }

    /// Connections registered under `network`.
    #[must_use]
    pub fn hosted_members(&self, network: &NetworkId) -> Vec<Arc<Connection>> {
        self.inner
            .hosted
            .lock()
            .unwrap()
            .get(network)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove a disposed connection from the client pool and from every
    /// hosted network, pruning networks that become empty.
    pub fn forget(&self, connection: &Arc<Connection>) {
        {
            let mut clients = self.inner.clients.lock().unwrap();
            clients.retain(|c| !Arc::ptr_eq(c, connection));
        }
        let mut hosted = self.inner.hosted.lock().unwrap();
        hosted.retain(|_, members| {
            members.retain(|c| !Arc::ptr_eq(c, connection));
            !members.is_empty()
        });
        connection.set_relay_client_mode(false);
    }
}
