//! HTTP client for the peer registry.

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use super::{Announcement, Neighbor, PeerRole};
use crate::code::EndpointId;
use crate::error::{Error, Result};
use crate::transport::Resolver;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct AnnounceBody {
    neighbors: Vec<Neighbor>,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    addr: SocketAddr,
}

/// Talks to a `wisp registry` server.
///
/// Every client carries a random key, so only this process can refresh or
/// withdraw the endpoints it published.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base: String,
    key: String,
    device: String,
}

impl RegistryClient {
    /// Create a client for the registry at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, device: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Registry(e.to_string()))?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            key: Uuid::new_v4().to_string(),
            device: device.into(),
        })
    }

    /// Registry base URL.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Announce `peer_id` and return the neighbors behind the same IP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointTaken`] if another live peer holds the id,
    /// or [`Error::Registry`] if the request fails.
    pub async fn announce(
        &self,
        peer_id: &EndpointId,
        role: PeerRole,
        addr: Option<SocketAddr>,
    ) -> Result<Vec<Neighbor>> {
        let announcement = Announcement {
            peer_id: peer_id.clone(),
            key: self.key.clone(),
            device: self.device.clone(),
            role,
            addr,
        };

        let response = self
            .http
            .post(format!("{}/api/discovery", self.base))
            .json(&announcement)
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        match response.status() {
            StatusCode::CONFLICT => Err(Error::EndpointTaken(peer_id.to_string())),
            status if status.is_success() => {
                let body: AnnounceBody = response
                    .json()
                    .await
                    .map_err(|e| Error::Registry(e.to_string()))?;
                Ok(body.neighbors)
            }
            status => Err(Error::Registry(format!("announce returned {status}"))),
        }
    }

    async fn withdraw_id(&self, peer_id: &EndpointId) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/api/peers/{}", self.base, peer_id))
            .query(&[("key", self.key.as_str())])
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        match response.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::Registry(format!("withdraw returned {status}"))),
        }
    }

    async fn resolve_id(&self, peer_id: &EndpointId) -> Result<Option<SocketAddr>> {
        let response = self
            .http
            .get(format!("{}/api/peers/{}", self.base, peer_id))
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ResolveBody = response
                    .json()
                    .await
                    .map_err(|e| Error::Registry(e.to_string()))?;
                Ok(Some(body.addr))
            }
            status => Err(Error::Registry(format!("lookup returned {status}"))),
        }
    }
}

impl Resolver for RegistryClient {
    fn publish<'a>(&'a self, id: &'a EndpointId, addr: SocketAddr) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.announce(id, PeerRole::Sender, Some(addr)).await?;
            Ok(())
        })
    }

    fn withdraw<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.withdraw_id(id))
    }

    fn resolve<'a>(&'a self, id: &'a EndpointId) -> BoxFuture<'a, Result<Option<SocketAddr>>> {
        Box::pin(self.resolve_id(id))
    }
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    async fn start_registry() -> (String, CancellationToken) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        let serving = cancel.clone();
        tokio::spawn(async move {
            let _ = super::super::server::serve_on(listener, serving).await;
        });
        (format!("http://{addr}"), cancel)
    }

    #[tokio::test]
    async fn test_publish_resolve_withdraw() {
        let (base, cancel) = start_registry().await;
        let sender = RegistryClient::new(&base, "laptop").expect("client");
        let receiver = RegistryClient::new(&base, "phone").expect("client");

        let id = EndpointId::from_raw("wisp-transfer-v2-424242");
        let addr: SocketAddr = "127.0.0.1:45000".parse().expect("addr");
        sender.publish(&id, addr).await.expect("publish");

        assert_eq!(receiver.resolve(&id).await.expect("resolve"), Some(addr));

        let err = receiver.publish(&id, addr).await.expect_err("taken");
        assert!(matches!(err, Error::EndpointTaken(_)));

        let neighbors = receiver
            .announce(&EndpointId::ephemeral(), PeerRole::Receiver, None)
            .await
            .expect("announce");
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].device, "laptop");

        sender.withdraw(&id).await.expect("withdraw");
        assert_eq!(receiver.resolve(&id).await.expect("resolve"), None);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let client = RegistryClient::new("http://127.0.0.1:9", "x").expect("client");
        let err = client
            .resolve(&EndpointId::from_raw("wisp-transfer-v2-000000"))
            .await
            .expect_err("unreachable");
        assert!(matches!(err, Error::Registry(_)));
    }
}
