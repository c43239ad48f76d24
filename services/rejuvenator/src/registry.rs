//! Assignment registry client.
//!
//! Provides the single call the engine makes to the registry: reporting an
//! old-to-new topology change so client bookkeeping follows the fleet.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use spotproxy_proto::TopologyUpdate;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::RegistryError;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn update_topology(&self, update: &TopologyUpdate) -> Result<(), RegistryError>;
}

/// Registry reached over HTTP.
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn update_topology(&self, update: &TopologyUpdate) -> Result<(), RegistryError> {
        let kind = update.kind()?;
        let url = format!("{}/assignments/postsingleupdate", self.base_url);
        debug!(
            url = %url,
            kind = ?kind,
            old = update.old_ips.len(),
            new = update.new_ips.len(),
            "Posting topology update"
        );

        let response = self.client.post(&url).json(update).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Registry rejected topology update");
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(kind = ?kind, members = update.new_ips.len().max(update.old_ips.len()), "Registry updated");
        Ok(())
    }
}

/// Registry that records updates instead of sending them.
#[derive(Default)]
pub struct RecordingRegistry {
    updates: Mutex<Vec<(TopologyUpdate, Instant)>>,
    fail: bool,
}

impl RecordingRegistry {
    /// A registry that rejects every update.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn updates(&self) -> Vec<TopologyUpdate> {
        self.updates.lock().await.iter().map(|(u, _)| u.clone()).collect()
    }

    /// When each accepted update arrived.
    pub async fn timestamps(&self) -> Vec<Instant> {
        self.updates.lock().await.iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl Registry for RecordingRegistry {
    async fn update_topology(&self, update: &TopologyUpdate) -> Result<(), RegistryError> {
        update.kind()?;
        if self.fail {
            return Err(RegistryError::Rejected {
                status: 503,
                body: "registry unavailable".to_string(),
            });
        }
        info!(old = ?update.old_ips, new = ?update.new_ips, "[MOCK] Recording topology update");
        self.updates.lock().await.push((update.clone(), Instant::now()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ips(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_posts_replacement() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/assignments/postsingleupdate"))
            .and(body_json(serde_json::json!({
                "old_ips": ["198.51.100.1", "198.51.100.2"],
                "new_ips": ["203.0.113.1", "203.0.113.2"],
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let update = TopologyUpdate::replace(
            ips(&["198.51.100.1", "198.51.100.2"]),
            ips(&["203.0.113.1", "203.0.113.2"]),
        )
        .unwrap();
        registry.update_topology(&update).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad lengths"))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let err = registry
            .update_topology(&TopologyUpdate::add(ips(&["203.0.113.1"])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Rejected { status: 400, ref body } if body == "bad lengths"
        ));
    }

    #[tokio::test]
    async fn test_invalid_update_never_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let update = TopologyUpdate {
            old_ips: ips(&["198.51.100.1", "198.51.100.2"]),
            new_ips: ips(&["203.0.113.1"]),
        };
        assert!(matches!(
            registry.update_topology(&update).await,
            Err(RegistryError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let registry = HttpRegistry::new(&url, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            registry
                .update_topology(&TopologyUpdate::add(ips(&["203.0.113.1"])))
                .await,
            Err(RegistryError::Transport(_))
        ));
    }
}
