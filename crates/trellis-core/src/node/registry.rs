//! The connection registry.
//!
//! Two maps under a single lock: endpoint to record and peer id to record.
//! Every read-then-modify on either map runs under that lock, and the lock
//! is never held across I/O; displaced records are returned to the caller
//! for teardown outside the critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use trellis_transport::{Endpoint, PeerId};

use super::connection::Connection;

/// Outcome of insert arbitration.
#[derive(Debug)]
pub enum InsertOutcome {
    /// The candidate was registered. `displaced` holds records that lost
    /// arbitration and were removed from both maps; the caller must close
    /// them.
    Inserted {
        /// Records removed in favor of the candidate
        displaced: Vec<Arc<Connection>>,
    },
    /// The candidate carried our own peer id.
    SelfConnection,
    /// A virtual candidate lost to an existing record.
    DuplicateVirtual,
    /// A real candidate lost to an existing real record.
    DuplicateReal,
}

struct Maps {
    by_endpoint: HashMap<Endpoint, Arc<Connection>>,
    by_peer: HashMap<PeerId, Arc<Connection>>,
}

impl Maps {
    fn remove_record(&mut self, record: &Arc<Connection>) {
        self.by_endpoint
            .retain(|_, existing| !Arc::ptr_eq(existing, record));
        self.by_peer
            .retain(|_, existing| !Arc::ptr_eq(existing, record));
    }
}

/// Dedup tables for established connections.
pub struct ConnectionRegistry {
    local_peer: PeerId,
    maps: Mutex<Maps>,
}

/// Whether a second real connection to the same peer may replace the first.
///
/// True iff the address families match and the existing endpoint is not a
/// private address.
#[must_use]
pub fn allow_new_connection(existing: &Endpoint, incoming: &Endpoint) -> bool {
    existing.family() == incoming.family() && !existing.is_private()
}

impl ConnectionRegistry {
    /// New registry for a node identified by `local_peer`.
    #[must_use]
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            maps: Mutex::new(Maps {
                by_endpoint: HashMap::new(),
                by_peer: HashMap::new(),
            }),
        }
    }

    /// Our own peer id.
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Run insert arbitration for `candidate`.
    ///
    /// The candidate is registered under both keys unless it loses to an
    /// existing record. Self-loops are rejected outright.
    pub fn insert(&self, candidate: &Arc<Connection>) -> InsertOutcome {
        if candidate.peer_id() == self.local_peer {
            return InsertOutcome::SelfConnection;
        }

        let endpoint = candidate.remote_endpoint().clone();
        let peer_id = candidate.peer_id();
        let mut displaced = Vec::new();
        let mut maps = self.maps.lock().unwrap();

        if let Some(existing) = maps.by_endpoint.get(&endpoint).cloned() {
            if existing.is_virtual() && !candidate.is_virtual() {
                maps.remove_record(&existing);
                displaced.push(existing);
            } else if candidate.is_virtual() {
                return InsertOutcome::DuplicateVirtual;
            } else {
                return InsertOutcome::DuplicateReal;
            }
        } else if let Some(existing) = maps.by_peer.get(&peer_id).cloned() {
            if existing.is_virtual() && !candidate.is_virtual() {
                maps.remove_record(&existing);
                displaced.push(existing);
            } else if candidate.is_virtual() {
                return InsertOutcome::DuplicateVirtual;
            } else if allow_new_connection(existing.remote_endpoint(), &endpoint) {
                maps.remove_record(&existing);
                displaced.push(existing);
            } else {
                return InsertOutcome::DuplicateReal;
            }
        }

        // Sweep residual entries under either key so both maps always point
        // at the same record for a given peer.
        if let Some(residual) = maps.by_endpoint.remove(&endpoint) {
            maps.remove_record(&residual);
            displaced.push(residual);
        }
        if let Some(residual) = maps.by_peer.remove(&peer_id) {
            maps.remove_record(&residual);
            displaced.push(residual);
        }

        maps.by_endpoint.insert(endpoint, Arc::clone(candidate));
        maps.by_peer.insert(peer_id, Arc::clone(candidate));
        InsertOutcome::Inserted { displaced }
    }

    /// Look up by remote endpoint.
    #[must_use]
    pub fn get_by_endpoint(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.maps.lock().unwrap().by_endpoint.get(endpoint).cloned()
    }

    /// Look up by peer id.
    #[must_use]
    pub fn get_by_peer(&self, peer_id: &PeerId) -> Option<Arc<Connection>> {
        self.maps.lock().unwrap().by_peer.get(peer_id).cloned()
    }

    /// Remove `record` from both maps. Returns whether it was registered.
    pub fn remove(&self, record: &Arc<Connection>) -> bool {
        let mut maps = self.maps.lock().unwrap();
        let registered = maps
            .by_peer
            .get(&record.peer_id())
            .map(|existing| Arc::ptr_eq(existing, record))
            .unwrap_or(false)
            || maps
                .by_endpoint
                .get(record.remote_endpoint())
                .map(|existing| Arc::ptr_eq(existing, record))
                .unwrap_or(false);
        maps.remove_record(record);
        registered
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.lock().unwrap().by_peer.len()
    }

    /// True when no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered record.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.maps.lock().unwrap().by_peer.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse().unwrap(), port)
    }

    fn conn(peer: PeerId, endpoint: Endpoint, is_virtual: bool) -> Arc<Connection> {
        Connection::new(peer, endpoint, is_virtual, None)
    }

    #[test]
    fn test_self_connection_rejected() {
        let local = PeerId::random();
        let registry = ConnectionRegistry::new(local);
        let candidate = conn(local, ep("203.0.113.1", 1), false);

        assert!(matches!(registry.insert(&candidate), InsertOutcome::SelfConnection));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_insert_registers_both_keys() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();
        let endpoint = ep("203.0.113.1", 41700);
        let candidate = conn(peer, endpoint.clone(), false);

        assert!(matches!(
            registry.insert(&candidate),
            InsertOutcome::Inserted { displaced } if displaced.is_empty()
        ));
        assert!(Arc::ptr_eq(&registry.get_by_peer(&peer).unwrap(), &candidate));
        assert!(Arc::ptr_eq(&registry.get_by_endpoint(&endpoint).unwrap(), &candidate));
    }

    #[test]
    fn test_maps_stay_coherent() {
        // Both maps must reference the same record for any registered peer.
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();
        let first = conn(peer, ep("203.0.113.1", 1), true);
        let second = conn(peer, ep("198.51.100.2", 1), false);

        registry.insert(&first);
        registry.insert(&second);

        let by_peer = registry.get_by_peer(&peer).unwrap();
        let by_ep = registry.get_by_endpoint(second.remote_endpoint()).unwrap();
        assert!(Arc::ptr_eq(&by_peer, &by_ep));
        assert!(registry.get_by_endpoint(first.remote_endpoint()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_virtual_displaced_by_real_same_endpoint() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();
        let endpoint = ep("203.0.113.1", 41700);

        let tunnel = conn(peer, endpoint.clone(), true);
        registry.insert(&tunnel);

        let direct = conn(peer, endpoint.clone(), false);
        let InsertOutcome::Inserted { displaced } = registry.insert(&direct) else {
            panic!("real connection must displace virtual");
        };
        assert_eq!(displaced.len(), 1);
        assert!(Arc::ptr_eq(&displaced[0], &tunnel));
        assert!(Arc::ptr_eq(&registry.get_by_peer(&peer).unwrap(), &direct));
    }

    #[test]
    fn test_virtual_loses_to_existing() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();
        let endpoint = ep("203.0.113.1", 41700);

        registry.insert(&conn(peer, endpoint.clone(), false));
        let late_tunnel = conn(peer, endpoint, true);
        assert!(matches!(registry.insert(&late_tunnel), InsertOutcome::DuplicateVirtual));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_both_real_same_endpoint_is_duplicate() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();
        let endpoint = ep("203.0.113.1", 41700);

        registry.insert(&conn(peer, endpoint.clone(), false));
        assert!(matches!(
            registry.insert(&conn(peer, endpoint, false)),
            InsertOutcome::DuplicateReal
        ));
    }

    #[test]
    fn test_real_vs_real_prefers_public_existing() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();

        // Existing record with a private endpoint blocks replacement.
        registry.insert(&conn(peer, ep("192.168.1.4", 41700), false));
        let public = conn(peer, ep("203.0.113.1", 41700), false);
        assert!(matches!(
            registry.insert(&public),
            InsertOutcome::DuplicateReal
        ));

        // Families match and the existing endpoint is public, so the
        // second view replaces it.
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();
        registry.insert(&conn(peer, ep("203.0.113.1", 41700), false));
        let other_view = conn(peer, ep("198.51.100.9", 41700), false);
        assert!(matches!(
            registry.insert(&other_view),
            InsertOutcome::Inserted { .. }
        ));
    }

    #[test]
    fn test_family_mismatch_blocks_replacement() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();
        registry.insert(&conn(peer, ep("203.0.113.1", 41700), false));

        let v6 = conn(peer, ep("2001:db8::1", 41700), false);
        assert!(matches!(registry.insert(&v6), InsertOutcome::DuplicateReal));
    }

    #[test]
    fn test_remove_clears_both_maps() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let peer = PeerId::random();
        let endpoint = ep("203.0.113.1", 41700);
        let record = conn(peer, endpoint.clone(), false);

        registry.insert(&record);
        assert!(registry.remove(&record));
        assert!(registry.get_by_peer(&peer).is_none());
        assert!(registry.get_by_endpoint(&endpoint).is_none());
        assert!(!registry.remove(&record));

        // A fresh insert with the same peer id succeeds after removal.
        assert!(matches!(
            registry.insert(&conn(peer, endpoint, false)),
            InsertOutcome::Inserted { .. }
        ));
    }

    #[test]
    fn test_allow_new_connection_rules() {
        assert!(allow_new_connection(&ep("203.0.113.1", 1), &ep("198.51.100.1", 1)));
        assert!(!allow_new_connection(&ep("192.168.0.1", 1), &ep("198.51.100.1", 1)));
        assert!(!allow_new_connection(&ep("203.0.113.1", 1), &ep("2001:db8::1", 1)));
        assert!(!allow_new_connection(&ep("fd00::1", 1), &ep("2001:db8::2", 1)));
    }
}
