//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;
use trellis_transport::{Endpoint, ProxyConfig};

/// How the anonymity overlay participates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayMode {
    /// Overlay not started; no overlay DHT node
    Disabled,
    /// Overlay available alongside the direct transports
    Enabled,
    /// Every outbound connection is pushed through the overlay
    Only,
}

/// Top-level node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Shared TCP service port carrying both the peer protocol and the
    /// DHT channel
    pub local_port: u16,

    /// Egress proxy for internet traffic
    pub proxy: Option<ProxyConfig>,

    /// Whether the reachability machine may try UPnP port mapping
    pub enable_upnp: bool,

    /// Whether local-segment discovery runs
    pub enable_local_discovery: bool,

    /// Anonymity-overlay participation
    pub overlay_mode: OverlayMode,

    /// Overlay controller settings
    pub overlay: OverlayConfig,

    /// Well-known bootstrap blob URL
    pub bootstrap_url: Option<String>,

    /// Statically configured bootstrap endpoints
    pub bootstrap_endpoints: Vec<Endpoint>,

    /// Reachability probing settings
    pub connectivity: ConnectivityConfig,

    /// Relay coordinator settings
    pub relay: RelayConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // Port 0 (auto-select) in tests to avoid conflicts
            #[cfg(test)]
            local_port: 0,
            #[cfg(not(test))]
            local_port: 41700,
            proxy: None,
            enable_upnp: true,
            enable_local_discovery: true,
            overlay_mode: OverlayMode::Disabled,
            overlay: OverlayConfig::default(),
            bootstrap_url: None,
            bootstrap_endpoints: Vec::new(),
            connectivity: ConnectivityConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Reachability probing settings.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Whether the periodic reachability machine runs
    pub enabled: bool,
    /// Cadence of the per-family checks
    pub check_interval: Duration,
    /// IPv4-only web probe URL
    pub probe_url_v4: String,
    /// IPv6-only web probe URL
    pub probe_url_v6: String,
    /// Incoming-connection web-check URL
    pub incoming_check_url: String,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(60),
            probe_url_v4: "https://ipv4.trellis-mesh.net/probe".to_string(),
            probe_url_v6: "https://ipv6.trellis-mesh.net/probe".to_string(),
            incoming_check_url: "https://ipv4.trellis-mesh.net/connectivity".to_string(),
        }
    }
}

/// Relay coordinator settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on relay-client connections
    pub max_relay_clients: usize,
    /// Cadence of the relay-client fill timer
    pub fill_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_relay_clients: 3,
            fill_interval: Duration::from_secs(30),
        }
    }
}

/// Overlay controller settings.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Path to the controller binary
    pub controller_path: PathBuf,
    /// Controller state directory; the hidden-service hostname is read
    /// from `<data_dir>/hidden_service/hostname`
    pub data_dir: PathBuf,
    /// How long to wait for the controller's SOCKS port and the
    /// hidden-service hostname at startup
    pub startup_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            controller_path: PathBuf::from("tor"),
            data_dir: PathBuf::from(".trellis/overlay"),
            startup_timeout: Duration::from_secs(90),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert!(config.enable_upnp);
        assert!(config.enable_local_discovery);
        assert_eq!(config.overlay_mode, OverlayMode::Disabled);
        assert_eq!(config.relay.max_relay_clients, 3);
        assert_eq!(config.connectivity.check_interval, Duration::from_secs(60));
    }
}
