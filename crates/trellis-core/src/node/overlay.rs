//! Anonymity-overlay adapter.
//!
//! Owns the external overlay-controller process. The controller offers a
//! SOCKS5 endpoint at `(127.0.0.1, service port + 2)` for outbound tunnels
//! and brings up a hidden service forwarding to the service port; its
//! published hostname becomes this node's overlay endpoint. The controller
//! outlives all DHT and connection state and is torn down last.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use trellis_transport::Endpoint;

use super::config::OverlayConfig;
use super::error::{NodeError, Result};

/// Offset of the controller's SOCKS port from the service port.
const SOCKS_PORT_OFFSET: u16 = 2;

/// Poll cadence while waiting for controller readiness.
const READINESS_POLL: Duration = Duration::from_millis(500);

/// Handle to the running overlay controller.
#[derive(Debug)]
pub struct OverlayAdapter {
    socks: SocketAddr,
    hidden_service: Endpoint,
    child: Mutex<Option<Child>>,
}

impl OverlayAdapter {
    /// Start the controller, wait for its SOCKS endpoint, and bring up the
    /// hidden service mapped to `local_port`.
    ///
    /// # Errors
    ///
    /// `Io` when the controller cannot be spawned, `Timeout` when the SOCKS
    /// port or the hidden-service hostname never appears.
    pub async fn start(config: &OverlayConfig, local_port: u16) -> Result<Self> {
        let socks_port = local_port + SOCKS_PORT_OFFSET;
        let socks = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, socks_port));
        let service_dir = config.data_dir.join("hidden_service");

        tokio::fs::create_dir_all(&config.data_dir).await?;

        let child = Command::new(&config.controller_path)
            .arg("--SocksPort")
            .arg(socks_port.to_string())
            .arg("--DataDirectory")
            .arg(&config.data_dir)
            .arg("--HiddenServiceDir")
            .arg(&service_dir)
            .arg("--HiddenServicePort")
            .arg(format!("{local_port} 127.0.0.1:{local_port}"))
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(
            controller = %config.controller_path.display(),
            socks = %socks,
            "overlay controller started"
        );

        let adapter = Self {
            socks,
            hidden_service: Endpoint::domain(String::new(), local_port),
            child: Mutex::new(Some(child)),
        };

        wait_for_socks(socks, config.startup_timeout).await?;
        let hostname = wait_for_hostname(&service_dir, config.startup_timeout).await?;
        tracing::info!(service = %hostname, "hidden service published");

        Ok(Self {
            hidden_service: Endpoint::domain(hostname, local_port),
            ..adapter
        })
    }

    /// The controller's SOCKS5 endpoint.
    #[must_use]
    pub fn socks_endpoint(&self) -> SocketAddr {
        self.socks
    }

    /// This node's hidden-service endpoint.
    #[must_use]
    pub fn hidden_service_endpoint(&self) -> Endpoint {
        self.hidden_service.clone()
    }

    /// Stop the controller process.
    pub async fn shutdown(&self) {
        let child = self.inner_child();
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                tracing::warn!("overlay controller kill failed: {err}");
            }
            tracing::info!("overlay controller stopped");
        }
    }

    fn inner_child(&self) -> Option<Child> {
        self.child.lock().unwrap().take()
    }
}

async fn wait_for_socks(socks: SocketAddr, deadline: Duration) -> Result<()> {
    let poll = async {
        loop {
            if TcpStream::connect(socks).await.is_ok() {
                return;
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    };
    tokio::time::timeout(deadline, poll)
        .await
        .map_err(|_| NodeError::timeout("overlay SOCKS endpoint"))
}

async fn wait_for_hostname(service_dir: &PathBuf, deadline: Duration) -> Result<String> {
    let dir = service_dir.clone();
    let poll = async move {
        loop {
            if let Ok(contents) = tokio::fs::read_to_string(dir.join("hostname")).await {
                let hostname = contents.trim().to_string();
                if !hostname.is_empty() {
                    return hostname;
                }
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    };
    tokio::time::timeout(deadline, poll)
        .await
        .map_err(|_| NodeError::timeout("hidden-service hostname"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Stand-in controller: the test itself provides the SOCKS listener and
    /// the hostname file; the spawned process just has to exist.
    #[tokio::test]
    async fn test_startup_readiness_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_port = listener.local_addr().unwrap().port();
        if socks_port < SOCKS_PORT_OFFSET {
            return;
        }
        let local_port = socks_port - SOCKS_PORT_OFFSET;

        let dir = tempfile::tempdir().unwrap();
        let service_dir = dir.path().join("hidden_service");
        std::fs::create_dir_all(&service_dir).unwrap();
        std::fs::write(service_dir.join("hostname"), "abcdefghij234567.onion\n").unwrap();

        let config = OverlayConfig {
            controller_path: PathBuf::from("/bin/true"),
            data_dir: dir.path().to_path_buf(),
            startup_timeout: Duration::from_secs(5),
        };

        let adapter = OverlayAdapter::start(&config, local_port).await.unwrap();
        assert_eq!(adapter.socks_endpoint().port(), socks_port);
        assert_eq!(
            adapter.hidden_service_endpoint(),
            Endpoint::domain("abcdefghij234567.onion", local_port)
        );
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_times_out_without_socks() {
        let dir = tempfile::tempdir().unwrap();
        let config = OverlayConfig {
            controller_path: PathBuf::from("/bin/true"),
            data_dir: dir.path().to_path_buf(),
            startup_timeout: Duration::from_millis(600),
        };

        // Port 1 on loopback is essentially never listening.
        let err = OverlayAdapter::start(&config, 1).await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout(_)));
    }
}
