//! Bootstrap endpoint blob.
//!
//! A node joins the internet DHTs by fetching a small binary blob from a
//! well-known HTTPS URL: `[count u8][endpoint]*`, each endpoint carrying its
//! own family tag. Fetch failures are the caller's to log and ignore; a node
//! without bootstrap still works on local segments.

use std::time::Duration;
use trellis_transport::{Endpoint, ProxyConfig, ProxyKind};

use crate::error::{DiscoveryError, Result};

/// Fetch deadline for the bootstrap blob.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Encode a bootstrap blob. Silently truncates to 255 endpoints.
#[must_use]
pub fn encode_bootstrap_blob(endpoints: &[Endpoint]) -> Vec<u8> {
    let count = endpoints.len().min(u8::MAX as usize);
    let mut blob = vec![count as u8];
    for endpoint in &endpoints[..count] {
        endpoint.encode(&mut blob);
    }
    blob
}

/// Parse a bootstrap blob into endpoints.
///
/// # Errors
///
/// `Bootstrap` when the blob is empty, truncated, or an endpoint fails to
/// decode.
pub fn parse_bootstrap_blob(blob: &[u8]) -> Result<Vec<Endpoint>> {
    let (&count, mut rest) = blob
        .split_first()
        .ok_or(DiscoveryError::Bootstrap("empty blob".into()))?;
    let mut endpoints = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (endpoint, consumed) = Endpoint::decode(rest)
            .map_err(|e| DiscoveryError::Bootstrap(e.to_string().into()))?;
        endpoints.push(endpoint);
        rest = &rest[consumed..];
    }
    Ok(endpoints)
}

/// Fetch and parse the bootstrap blob from `url`, optionally through the
/// configured proxy.
///
/// # Errors
///
/// `Bootstrap` on client construction, transfer, HTTP status, or parse
/// failure.
pub async fn fetch_bootstrap_endpoints(
    url: &str,
    proxy: Option<&ProxyConfig>,
) -> Result<Vec<Endpoint>> {
    let mut builder = reqwest::Client::builder().timeout(FETCH_TIMEOUT);
    if let Some(proxy) = proxy {
        let scheme = match proxy.kind {
            ProxyKind::Http => format!("http://{}", proxy.endpoint),
            ProxyKind::Socks5 => format!("socks5h://{}", proxy.endpoint),
        };
        let proxy = reqwest::Proxy::all(scheme)
            .map_err(|e| DiscoveryError::Bootstrap(e.to_string().into()))?;
        builder = builder.proxy(proxy);
    }
    let client = builder
        .build()
        .map_err(|e| DiscoveryError::Bootstrap(e.to_string().into()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| DiscoveryError::Bootstrap(e.to_string().into()))?;
    if !response.status().is_success() {
        return Err(DiscoveryError::Bootstrap(
            format!("bootstrap endpoint answered {}", response.status()).into(),
        ));
    }
    let blob = response
        .bytes()
        .await
        .map_err(|e| DiscoveryError::Bootstrap(e.to_string().into()))?;

    parse_bootstrap_blob(&blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn test_blob_roundtrip_mixed_families() {
        let endpoints = vec![
            Endpoint::new("203.0.113.4".parse::<IpAddr>().unwrap(), 41700),
            Endpoint::new("2001:db8::9".parse::<IpAddr>().unwrap(), 41700),
            Endpoint::domain("bootstrap.onion", 41700),
        ];
        let blob = encode_bootstrap_blob(&endpoints);
        assert_eq!(blob[0], 3);
        assert_eq!(parse_bootstrap_blob(&blob).unwrap(), endpoints);
    }

    #[test]
    fn test_empty_blob_rejected() {
        assert!(parse_bootstrap_blob(&[]).is_err());
    }

    #[test]
    fn test_zero_count_blob_is_empty() {
        assert!(parse_bootstrap_blob(&[0]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let endpoints = vec![Endpoint::new("203.0.113.4".parse::<IpAddr>().unwrap(), 41700)];
        let mut blob = encode_bootstrap_blob(&endpoints);
        blob.truncate(blob.len() - 1);
        assert!(parse_bootstrap_blob(&blob).is_err());
    }

    #[test]
    fn test_count_larger_than_payload_rejected() {
        let endpoints = vec![Endpoint::new("203.0.113.4".parse::<IpAddr>().unwrap(), 41700)];
        let mut blob = encode_bootstrap_blob(&endpoints);
        blob[0] = 2;
        assert!(parse_bootstrap_blob(&blob).is_err());
    }
}
