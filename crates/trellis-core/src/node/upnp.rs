//! UPnP gateway access.
//!
//! Thin trait seam over `igd-next` so the reachability machine's mapping
//! flow is testable with a fake gateway. The SOAP protocol itself is the
//! crate's concern, not ours.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use super::error::{NodeError, Result};

/// Gateway search deadline.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Mapping description shown in router admin UIs.
const MAPPING_DESCRIPTION: &str = "trellis-mesh";

/// A discovered UPnP internet gateway.
#[async_trait]
pub trait UpnpGateway: Send + Sync {
    /// The gateway's reported external IP.
    async fn external_ip(&self) -> Result<IpAddr>;

    /// Forward TCP `port` on the gateway to `local`.
    async fn add_tcp_mapping(&self, port: u16, local: SocketAddrV4) -> Result<()>;
}

/// Discovers the gateway serving the default route.
#[async_trait]
pub trait UpnpProvider: Send + Sync {
    /// Search for a UPnP-capable gateway.
    async fn discover(&self) -> Result<Arc<dyn UpnpGateway>>;
}

/// Production provider over `igd-next`.
pub struct IgdProvider;

struct IgdGateway {
    gateway: igd_next::aio::Gateway<igd_next::aio::tokio::Tokio>,
}

#[async_trait]
impl UpnpProvider for IgdProvider {
    async fn discover(&self) -> Result<Arc<dyn UpnpGateway>> {
        let gateway = igd_next::aio::tokio::search_gateway(igd_next::SearchOptions {
            timeout: Some(SEARCH_TIMEOUT),
            ..Default::default()
        })
        .await
        .map_err(|e| NodeError::Upnp(format!("gateway search failed: {e}")))?;
        tracing::debug!(gateway = %gateway.addr, "UPnP gateway found");
        Ok(Arc::new(IgdGateway { gateway }))
    }
}

#[async_trait]
impl UpnpGateway for IgdGateway {
    async fn external_ip(&self) -> Result<IpAddr> {
        self.gateway
            .get_external_ip()
            .await
            .map_err(|e| NodeError::Upnp(format!("external IP query failed: {e}")))
    }

    async fn add_tcp_mapping(&self, port: u16, local: SocketAddrV4) -> Result<()> {
        self.gateway
            .add_port(
                igd_next::PortMappingProtocol::TCP,
                port,
                std::net::SocketAddr::V4(local),
                0,
                MAPPING_DESCRIPTION,
            )
            .await
            .map_err(|e| NodeError::Upnp(format!("port mapping failed: {e}")))
    }
}
