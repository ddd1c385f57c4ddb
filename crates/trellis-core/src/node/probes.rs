//! Connectivity probes.
//!
//! The reachability machine never talks to the network directly; it drives
//! these probes, which makes the transition logic testable with fakes.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use trellis_transport::{Endpoint, ProxyConfig, ProxyKind};

use super::config::ConnectivityConfig;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROXY_REACH_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe surface the reachability machine drives.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Unauthenticated IPv4-only web probe.
    async fn probe_ipv4(&self) -> bool;

    /// Unauthenticated IPv6-only web probe.
    async fn probe_ipv6(&self) -> bool;

    /// Whether the configured proxy accepts TCP connections at all.
    async fn proxy_reachable(&self, proxy: &ProxyConfig) -> bool;

    /// Web probe routed through the configured proxy.
    async fn probe_via_proxy(&self, proxy: &ProxyConfig) -> bool;

    /// Incoming-connection web-check: an external service dials back to
    /// `port`. `Some(endpoint)` carries the externally observed endpoint on
    /// success; `None` means the port was not reachable.
    async fn incoming_check(&self, port: u16) -> Option<Endpoint>;
}

/// Production probe implementation over HTTPS.
pub struct WebProbe {
    config: ConnectivityConfig,
}

impl WebProbe {
    /// Probe against the configured URLs.
    #[must_use]
    pub fn new(config: ConnectivityConfig) -> Self {
        Self { config }
    }

    fn family_client(&self, local: IpAddr) -> Option<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .local_address(local)
            .build()
            .ok()
    }
}

#[async_trait]
impl ConnectivityProbe for WebProbe {
    async fn probe_ipv4(&self) -> bool {
        let Some(client) = self.family_client(IpAddr::V4(Ipv4Addr::UNSPECIFIED)) else {
            return false;
        };
        matches!(
            client.get(&self.config.probe_url_v4).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    async fn probe_ipv6(&self) -> bool {
        let Some(client) = self.family_client(IpAddr::V6(Ipv6Addr::UNSPECIFIED)) else {
            return false;
        };
        matches!(
            client.get(&self.config.probe_url_v6).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    async fn proxy_reachable(&self, proxy: &ProxyConfig) -> bool {
        let endpoint: SocketAddr = proxy.endpoint;
        tokio::time::timeout(PROXY_REACH_TIMEOUT, tokio::net::TcpStream::connect(endpoint))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    async fn probe_via_proxy(&self, proxy: &ProxyConfig) -> bool {
        let scheme = match proxy.kind {
            ProxyKind::Http => format!("http://{}", proxy.endpoint),
            ProxyKind::Socks5 => format!("socks5h://{}", proxy.endpoint),
        };
        let Ok(proxy) = reqwest::Proxy::all(scheme) else {
            return false;
        };
        let Ok(client) = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .proxy(proxy)
            .build()
        else {
            return false;
        };
        matches!(
            client.get(&self.config.probe_url_v4).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    async fn incoming_check(&self, port: u16) -> Option<Endpoint> {
        let Some(client) = self.family_client(IpAddr::V4(Ipv4Addr::UNSPECIFIED)) else {
            return None;
        };
        let url = format!("{}?port={}", self.config.incoming_check_url, port);
        let response = client.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.bytes().await.ok()?;
        parse_incoming_check(&body)
    }
}

/// Parse the incoming-connection web-check body: `0x01` followed by an
/// encoded endpoint on success, `0x00` on failure.
#[must_use]
pub fn parse_incoming_check(body: &[u8]) -> Option<Endpoint> {
    match body.split_first() {
        Some((1, rest)) => Endpoint::decode(rest).ok().map(|(endpoint, _)| endpoint),
        _ => None,
    }
}
