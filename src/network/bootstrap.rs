//! HTTP bootstrap rendezvous
//!
//! A peer with no link yet reaches the coordinator by POSTing its offer to
//! `/connect_webrtc_peer` and receiving the answer in the reply.

use std::time::Duration;

use async_trait::async_trait;

use crate::constants::CONNECT_ROUTE;
use crate::error::{Error, Result, SignalingError};
use crate::protocol::{ConnectRequest, ConnectResponse};

/// Client side of the bootstrap exchange
#[async_trait]
pub trait BootstrapClient: Send + Sync {
    /// Send an offer to the coordinator at `address`
    async fn connect(
        &self,
        address: &str,
        request: &ConnectRequest,
    ) -> std::result::Result<ConnectResponse, SignalingError>;
}

/// `http://host:port/connect_webrtc_peer` for a bare or full address
pub fn connect_url(address: &str) -> String {
    let base = address.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}{}", base, CONNECT_ROUTE)
    } else {
        format!("http://{}{}", base, CONNECT_ROUTE)
    }
}

/// `BootstrapClient` over reqwest
pub struct HttpBootstrapClient {
    client: reqwest::Client,
}

impl HttpBootstrapClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BootstrapClient for HttpBootstrapClient {
    async fn connect(
        &self,
        address: &str,
        request: &ConnectRequest,
    ) -> std::result::Result<ConnectResponse, SignalingError> {
        let url = connect_url(address);
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| SignalingError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SignalingError::Malformed(e.to_string()))?;

        if !status.is_success() {
            // Error replies carry `{status: "error", error}` when they come
            // from a coordinator; anything else is reported by status code
            let reason = serde_json::from_str::<ConnectResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(SignalingError::Rejected(reason));
        }

        serde_json::from_str(&body).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionDescription;

    #[test]
    fn test_connect_url() {
        assert_eq!(
            connect_url("192.168.1.4:6512"),
            "http://192.168.1.4:6512/connect_webrtc_peer"
        );
        assert_eq!(
            connect_url("http://coord.local:6512/"),
            "http://coord.local:6512/connect_webrtc_peer"
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = HttpBootstrapClient::new(Duration::from_secs(2)).unwrap();
        let request = ConnectRequest {
            name: "den".into(),
            uuid: "u1".into(),
            sdp: SessionDescription::offer("v=0"),
        };
        let err = client.connect(&address, &request).await.unwrap_err();
        assert!(matches!(err, SignalingError::Unreachable { .. }));
    }
}
