//! Internet reachability classification.
//!
//! Two per-family state machines run on a shared 60-second timer,
//! independent of the data path. Probe I/O lives behind the
//! [`ConnectivityProbe`], [`UpnpProvider`], and [`InterfaceSource`] seams;
//! each tick recomputes the classification from scratch and every internal
//! failure is absorbed into the resulting state. Readers may observe stale
//! values; there is a single writer.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use trellis_transport::{Endpoint, ProxyConfig, ProxyKind};

use super::config::ConnectivityConfig;
use super::probes::ConnectivityProbe;
use super::upnp::UpnpProvider;

/// Reachability classification of one IP family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityStatus {
    /// No check has completed yet
    Identifying,
    /// No route to the internet on this family
    NoInternet,
    /// Public address on the default interface
    Direct,
    /// Traffic flows through a configured HTTP proxy
    HttpProxy,
    /// Traffic flows through a configured SOCKS5 proxy
    Socks5Proxy,
    /// Behind NAT with a working UPnP gateway
    NatViaUpnp,
    /// Behind NAT or a firewall, no usable UPnP
    NatOrFirewalled,
    /// Public address but inbound connections are blocked
    Firewalled,
    /// Configured proxy did not accept connections
    ProxyFailed,
    /// Proxy reachable but no internet behind it
    NoProxyInternet,
}

/// State of the UPnP port-mapping sub-machine (IPv4 only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpnpStatus {
    /// No attempt has completed yet
    Identifying,
    /// Disabled by configuration, proxy, or public address
    Disabled,
    /// No UPnP-capable gateway answered
    DeviceNotFound,
    /// The gateway's external address is itself private
    ExternalIpPrivate,
    /// Mapping accepted and externally confirmed
    PortForwarded,
    /// The gateway refused the mapping
    PortForwardingFailed,
    /// Mapping accepted but the incoming check failed
    PortForwardedNotAccessible,
}

/// Mutable per-family classification state.
#[derive(Debug, Clone)]
pub struct FamilyState {
    /// Current classification
    pub status: ReachabilityStatus,
    /// Local address of the default interface, when known
    pub live_ip: Option<IpAddr>,
    /// External IP reported by the UPnP gateway, when known
    pub upnp_external: Option<IpAddr>,
    /// Externally observed endpoint from the incoming-connection check
    pub checked_external: Option<Endpoint>,
}

impl Default for FamilyState {
    fn default() -> Self {
        Self {
            status: ReachabilityStatus::Identifying,
            live_ip: None,
            upnp_external: None,
            checked_external: None,
        }
    }
}

/// Default-route interface discovery seam.
pub trait InterfaceSource: Send + Sync {
    /// The default IPv4 interface's local address, if any.
    fn default_ipv4(&self) -> Option<Ipv4Addr>;
    /// A global IPv6 address on a default-capable interface, if any.
    fn default_ipv6(&self) -> Option<IpAddr>;
}

/// Production interface source over `default-net`.
pub struct SystemInterfaceSource;

impl InterfaceSource for SystemInterfaceSource {
    fn default_ipv4(&self) -> Option<Ipv4Addr> {
        let iface = default_net::get_default_interface().ok()?;
        iface.ipv4.first().map(|net| net.addr)
    }

    fn default_ipv6(&self) -> Option<IpAddr> {
        let iface = default_net::get_default_interface().ok()?;
        iface
            .ipv6
            .iter()
            .map(|net| IpAddr::V6(net.addr))
            .find(|ip| !Endpoint::new(*ip, 0).is_private())
    }
}

struct MonitorInner {
    local_port: u16,
    enable_upnp: bool,
    proxy: Option<ProxyConfig>,
    config: ConnectivityConfig,
    probe: Arc<dyn ConnectivityProbe>,
    upnp: Arc<dyn UpnpProvider>,
    ifaces: Arc<dyn InterfaceSource>,
    v4: RwLock<FamilyState>,
    v6: RwLock<FamilyState>,
    upnp_status: RwLock<UpnpStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Periodic reachability monitor.
#[derive(Clone)]
pub struct ReachabilityMonitor {
    inner: Arc<MonitorInner>,
}

impl ReachabilityMonitor {
    /// Build a monitor with injected probe, UPnP, and interface seams.
    #[must_use]
    pub fn new(
        local_port: u16,
        enable_upnp: bool,
        proxy: Option<ProxyConfig>,
        config: ConnectivityConfig,
        probe: Arc<dyn ConnectivityProbe>,
        upnp: Arc<dyn UpnpProvider>,
        ifaces: Arc<dyn InterfaceSource>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                local_port,
                enable_upnp,
                proxy,
                config,
                probe,
                upnp,
                ifaces,
                v4: RwLock::new(FamilyState::default()),
                v6: RwLock::new(FamilyState::default()),
                upnp_status: RwLock::new(UpnpStatus::Identifying),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the periodic timer. The first check runs immediately; the UI
    /// tolerates `Identifying` until it completes.
    pub fn start(&self) {
        let monitor = self.clone();
        let interval = self.inner.config.check_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.recheck_connectivity().await;
            }
        });
        *self.inner.task.lock().unwrap() = Some(task);
    }

    /// Stop the periodic timer.
    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Run one check of both families now.
    pub async fn recheck_connectivity(&self) {
        self.check_ipv4().await;
        self.check_ipv6().await;
        tracing::debug!(
            v4 = ?self.ipv4_status(),
            v6 = ?self.ipv6_status(),
            upnp = ?self.upnp_status(),
            "reachability updated"
        );
    }

    /// Current IPv4 classification.
    #[must_use]
    pub fn ipv4_status(&self) -> ReachabilityStatus {
        self.inner.v4.read().unwrap().status
    }

    /// Current IPv6 classification.
    #[must_use]
    pub fn ipv6_status(&self) -> ReachabilityStatus {
        self.inner.v6.read().unwrap().status
    }

    /// Current UPnP sub-state.
    #[must_use]
    pub fn upnp_status(&self) -> UpnpStatus {
        *self.inner.upnp_status.read().unwrap()
    }

    /// The advertisable IPv4 endpoint, per the current classification.
    #[must_use]
    pub fn ipv4_external_endpoint(&self) -> Option<Endpoint> {
        let state = self.inner.v4.read().unwrap();
        let port = self.inner.local_port;
        match state.status {
            ReachabilityStatus::Identifying => None,
            ReachabilityStatus::Direct => state.live_ip.map(|ip| Endpoint::new(ip, port)),
            ReachabilityStatus::NatViaUpnp if self.upnp_status() == UpnpStatus::PortForwarded => {
                state.upnp_external.map(|ip| Endpoint::new(ip, port))
            }
            _ => state.checked_external.clone(),
        }
    }

    /// The advertisable IPv6 endpoint: only a direct connection has one.
    #[must_use]
    pub fn ipv6_external_endpoint(&self) -> Option<Endpoint> {
        let state = self.inner.v6.read().unwrap();
        match state.status {
            ReachabilityStatus::Direct => {
                state.live_ip.map(|ip| Endpoint::new(ip, self.inner.local_port))
            }
            _ => None,
        }
    }

    async fn check_proxy(&self, proxy: &ProxyConfig) -> ReachabilityStatus {
        if !self.inner.probe.proxy_reachable(proxy).await {
            return ReachabilityStatus::ProxyFailed;
        }
        if !self.inner.probe.probe_via_proxy(proxy).await {
            return ReachabilityStatus::NoProxyInternet;
        }
        match proxy.kind {
            ProxyKind::Http => ReachabilityStatus::HttpProxy,
            ProxyKind::Socks5 => ReachabilityStatus::Socks5Proxy,
        }
    }

    async fn check_ipv4(&self) {
        let previous = self.inner.v4.read().unwrap().clone();
        let previous_upnp = self.upnp_status();
        let port = self.inner.local_port;

        // Proxy configuration short-circuits the whole flow.
        if let Some(proxy) = self.inner.proxy.clone() {
            let status = self.check_proxy(&proxy).await;
            *self.inner.upnp_status.write().unwrap() = UpnpStatus::Disabled;
            *self.inner.v4.write().unwrap() = FamilyState { status, ..FamilyState::default() };
            return;
        }

        let mut next = FamilyState::default();
        let mut upnp_next = UpnpStatus::Disabled;

        match self.inner.ifaces.default_ipv4() {
            None => {
                next.status = ReachabilityStatus::NoInternet;
            }
            Some(local) => {
                if !Endpoint::new(IpAddr::V4(local), port).is_private() {
                    next.status = ReachabilityStatus::Direct;
                    next.live_ip = Some(IpAddr::V4(local));
                } else if !self.inner.enable_upnp {
                    next.status = ReachabilityStatus::NatOrFirewalled;
                } else {
                    (next.status, upnp_next, next.upnp_external) =
                        self.run_upnp_flow(local, port, previous_upnp).await;
                }
            }
        }

        // Validate with the plain web probe whenever the classification or
        // the external address moved.
        let changed =
            next.status != previous.status || next.upnp_external != previous.upnp_external;
        if changed
            && next.status != ReachabilityStatus::NoInternet
            && !self.inner.probe.probe_ipv4().await
        {
            next.status = ReachabilityStatus::NoInternet;
            next.live_ip = None;
            next.upnp_external = None;
        }

        // Incoming-connection check runs every tick for the states whose
        // external endpoint depends on it.
        match next.status {
            ReachabilityStatus::Direct => match self.inner.probe.incoming_check(port).await {
                Some(observed) => next.checked_external = Some(observed),
                None => {
                    next.checked_external = None;
                    next.status = ReachabilityStatus::Firewalled;
                }
            },
            ReachabilityStatus::NatOrFirewalled => {
                next.checked_external = self.inner.probe.incoming_check(port).await;
            }
            ReachabilityStatus::NatViaUpnp if upnp_next == UpnpStatus::PortForwarded => {
                match self.inner.probe.incoming_check(port).await {
                    Some(observed) => next.checked_external = Some(observed),
                    None => {
                        next.checked_external = None;
                        upnp_next = UpnpStatus::PortForwardedNotAccessible;
                    }
                }
            }
            _ => {}
        }

        *self.inner.upnp_status.write().unwrap() = upnp_next;
        *self.inner.v4.write().unwrap() = next;
    }

    async fn run_upnp_flow(
        &self,
        local: Ipv4Addr,
        port: u16,
        previous_upnp: UpnpStatus,
    ) -> (ReachabilityStatus, UpnpStatus, Option<IpAddr>) {
        let gateway = match self.inner.upnp.discover().await {
            Ok(gateway) => gateway,
            Err(err) => {
                tracing::debug!("UPnP discovery failed: {err}");
                return (ReachabilityStatus::NatOrFirewalled, UpnpStatus::DeviceNotFound, None);
            }
        };

        let external = match gateway.external_ip().await {
            Ok(external) => external,
            Err(err) => {
                tracing::debug!("UPnP external IP query failed: {err}");
                return (
                    ReachabilityStatus::NatOrFirewalled,
                    UpnpStatus::PortForwardingFailed,
                    None,
                );
            }
        };

        if external.is_unspecified() {
            // A gateway reporting 0.0.0.0 has no upstream connection.
            return (ReachabilityStatus::NoInternet, previous_upnp, None);
        }

        if Endpoint::new(external, port).is_private() {
            return (
                ReachabilityStatus::NatViaUpnp,
                UpnpStatus::ExternalIpPrivate,
                Some(external),
            );
        }

        match gateway.add_tcp_mapping(port, SocketAddrV4::new(local, port)).await {
            Ok(()) => {
                tracing::info!(external = %external, port, "UPnP port mapping established");
                (ReachabilityStatus::NatViaUpnp, UpnpStatus::PortForwarded, Some(external))
            }
            Err(err) => {
                tracing::debug!("UPnP mapping refused: {err}");
                (
                    ReachabilityStatus::NatOrFirewalled,
                    UpnpStatus::PortForwardingFailed,
                    Some(external),
                )
            }
        }
    }

    async fn check_ipv6(&self) {
        let previous = self.inner.v6.read().unwrap().clone();

        if let Some(proxy) = self.inner.proxy.clone() {
            let status = self.check_proxy(&proxy).await;
            *self.inner.v6.write().unwrap() = FamilyState { status, ..FamilyState::default() };
            return;
        }

        let mut next = FamilyState::default();
        match self.inner.ifaces.default_ipv6() {
            Some(ip) => {
                next.status = ReachabilityStatus::Direct;
                next.live_ip = Some(ip);
            }
            None => {
                next.status = ReachabilityStatus::NoInternet;
            }
        }

        if next.status != previous.status
            && next.status == ReachabilityStatus::Direct
            && !self.inner.probe.probe_ipv6().await
        {
            next.status = ReachabilityStatus::NoInternet;
            next.live_ip = None;
        }

        *self.inner.v6.write().unwrap() = next;
    }
}
