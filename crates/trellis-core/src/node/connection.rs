//! Connection records and in-flight connect coalescing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use trellis_transport::{Endpoint, PeerId, PeerStream};

use super::error::{NodeError, Result};

/// Persistent read deadline applied to established peer streams.
pub const PERSISTENT_READ_TIMEOUT: Duration = Duration::from_secs(120);
/// Persistent write deadline applied to established peer streams.
pub const PERSISTENT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// One established peer connection.
///
/// Owned by the registry while registered; the stream is owned by the record
/// and handed to the application exactly once. The stream carries the
/// persistent read/write deadlines, applied by the handshake on success and
/// exposed through [`Connection::read_timeout`] and
/// [`Connection::write_timeout`].
pub struct Connection {
    peer_id: PeerId,
    remote_endpoint: Endpoint,
    is_virtual: bool,
    relay_client_mode: AtomicBool,
    disposed: AtomicBool,
    stream: Mutex<Option<Box<dyn PeerStream>>>,
    read_timeout: Duration,
    write_timeout: Duration,
    // Weak so a tunnel never keeps its relay alive.
    via_relay: Mutex<Option<Weak<Connection>>>,
}

impl Connection {
    /// Build a record. `stream` may be attached later on the accept path,
    /// after the response byte has been written.
    #[must_use]
    pub fn new(
        peer_id: PeerId,
        remote_endpoint: Endpoint,
        is_virtual: bool,
        stream: Option<Box<dyn PeerStream>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            remote_endpoint,
            is_virtual,
            relay_client_mode: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            stream: Mutex::new(stream),
            read_timeout: PERSISTENT_READ_TIMEOUT,
            write_timeout: PERSISTENT_WRITE_TIMEOUT,
            via_relay: Mutex::new(None),
        })
    }

    /// The persistent read deadline carried by this connection's stream.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// The persistent write deadline carried by this connection's stream.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Record the relay connection this tunnel runs through.
    pub fn set_via_relay(&self, relay: &Arc<Connection>) {
        *self.via_relay.lock().unwrap() = Some(Arc::downgrade(relay));
    }

    /// True when this record is a tunnel through `relay`.
    #[must_use]
    pub fn is_via_relay(&self, relay: &Arc<Connection>) -> bool {
        self.via_relay
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|held| Arc::ptr_eq(&held, relay))
            .unwrap_or(false)
    }

    /// The remote peer's id.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The remote service endpoint.
    #[must_use]
    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.remote_endpoint
    }

    /// True when the stream runs through a relay tunnel rather than a
    /// direct TCP connection.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// Whether this connection serves as one of our relay clients.
    #[must_use]
    pub fn is_relay_client(&self) -> bool {
        self.relay_client_mode.load(Ordering::Acquire)
    }

    /// Flag or clear relay-client mode.
    pub fn set_relay_client_mode(&self, enabled: bool) {
        self.relay_client_mode.store(enabled, Ordering::Release);
    }

    /// Attach the stream (accept path, after the response write).
    pub fn attach_stream(&self, stream: Box<dyn PeerStream>) {
        *self.stream.lock().unwrap() = Some(stream);
    }

    /// Take ownership of the stream. Returns `None` if already taken or
    /// the record was disposed.
    #[must_use]
    pub fn take_stream(&self) -> Option<Box<dyn PeerStream>> {
        self.stream.lock().unwrap().take()
    }

    /// True once [`Connection::close`] ran.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Drop the stream and mark the record disposed. Closing the socket is
    /// the cancellation signal for any loop reading it.
    pub fn close(&self) {
        self.disposed.store(true, Ordering::Release);
        self.stream.lock().unwrap().take();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_id)
            .field("endpoint", &self.remote_endpoint)
            .field("virtual", &self.is_virtual)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Per-endpoint in-flight set.
///
/// The first caller to an endpoint wins and dials; later callers wait on the
/// notify handle and re-check the registry after waking. Results are not
/// shared through the table. One instance exists for real connects and one
/// for virtual (tunneled) connects.
#[derive(Default)]
pub struct InFlightTable {
    set: Mutex<HashSet<Endpoint>>,
    notify: Notify,
}

/// Removes the endpoint from the owning table on drop and wakes all
/// waiters so their own re-checks can run.
pub struct InFlightGuard<'a> {
    table: &'a InFlightTable,
    endpoint: Endpoint,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.table.set.lock().unwrap().remove(&self.endpoint);
        self.table.notify.notify_waiters();
    }
}

impl InFlightTable {
    /// New empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `endpoint`; `None` when another attempt is already in flight.
    #[must_use]
    pub fn begin(&self, endpoint: &Endpoint) -> Option<InFlightGuard<'_>> {
        let mut set = self.set.lock().unwrap();
        if set.insert(endpoint.clone()) {
            Some(InFlightGuard { table: self, endpoint: endpoint.clone() })
        } else {
            None
        }
    }

    /// True while an attempt to `endpoint` is in flight.
    #[must_use]
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.set.lock().unwrap().contains(endpoint)
    }

    /// Wait until no attempt to `endpoint` is in flight.
    ///
    /// # Errors
    ///
    /// `ConnectInProgress` when `deadline` elapses first.
    pub async fn wait_clear(&self, endpoint: &Endpoint, deadline: Duration) -> Result<()> {
        let waiting = async {
            loop {
                // Register interest before the re-check so a removal between
                // check and await cannot be missed.
                let notified = self.notify.notified();
                if !self.contains(endpoint) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, waiting)
            .await
            .map_err(|_| NodeError::ConnectInProgress)
    }
}
