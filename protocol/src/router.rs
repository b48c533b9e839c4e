use serde_json::Value;
use std::time::Duration;

use crate::error::MeshError;
use crate::peer::{PeerRecord, PeerRegistry};

/// Where a request for a given target should go.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    Local,
    Forward(PeerRecord),
}

/// Decides local-handle vs. forward-to-peer and carries forwards out.
///
/// Matching order: own service name / capabilities, then the service
/// index, then the first capability match. No load balancing beyond
/// that. Forwarding failures are not retried here — retry policy
/// belongs to the caller.
#[derive(Clone)]
pub struct RequestRouter {
    registry: PeerRegistry,
    service_name: String,
    capabilities: Vec<String>,
    http: reqwest::Client,
    forward_timeout: Duration,
}

impl RequestRouter {
    pub fn new(
        registry: PeerRegistry,
        service_name: String,
        capabilities: Vec<String>,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            service_name,
            capabilities,
            http: reqwest::Client::new(),
            forward_timeout,
        }
    }

    pub async fn decide(&self, target: &str) -> Result<RouteDecision, MeshError> {
        if self.service_name == target || self.capabilities.iter().any(|c| c == target) {
            return Ok(RouteDecision::Local);
        }

        if let Some(peer) = self.registry.find_by_service(target).await {
            return Ok(RouteDecision::Forward(peer));
        }
        if let Some(peer) = self.registry.find_by_capability(target).await.into_iter().next() {
            return Ok(RouteDecision::Forward(peer));
        }

        Err(MeshError::NoRoute {
            target: target.to_string(),
            available: self.registry.service_names().await,
        })
    }

    /// Proxy a request body verbatim to a peer and relay its JSON reply.
    pub async fn forward(
        &self,
        peer: &PeerRecord,
        endpoint: &str,
        body: &Value,
    ) -> Result<Value, MeshError> {
        let url = format!("{}{}", peer.base_url(), endpoint);
        let resp = self
            .http
            .post(&url)
            .timeout(self.forward_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                self.registry_failure(&peer.node_id);
                MeshError::PeerUnreachable {
                    peer: peer.node_id.clone(),
                    reason: e.to_string(),
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(MeshError::MalformedResponse {
                peer: peer.node_id.clone(),
                reason: format!("HTTP {status}"),
            });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| MeshError::MalformedResponse {
                peer: peer.node_id.clone(),
                reason: e.to_string(),
            })
    }

    /// Forward to a specific node id, if we know it.
    pub async fn forward_to_node(
        &self,
        node_id: &str,
        endpoint: &str,
        body: &Value,
    ) -> Result<Value, MeshError> {
        let peer = self.registry.get(node_id).await.ok_or_else(|| {
            MeshError::NoRoute {
                target: node_id.to_string(),
                available: vec![],
            }
        })?;
        self.forward(&peer, endpoint, body).await
    }

    // Failure bookkeeping is fire-and-forget; the send path should not
    // block on the registry lock.
    fn registry_failure(&self, node_id: &str) {
        let registry = self.registry.clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            registry.record_failure(&node_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn peer(node_id: &str, service: &str, caps: &[&str]) -> PeerRecord {
        PeerRecord {
            node_id: node_id.into(),
            service_name: service.into(),
            host: "localhost".into(),
            port: 9999,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            last_seen: Utc::now(),
        }
    }

    fn router(registry: PeerRegistry) -> RequestRouter {
        RequestRouter::new(
            registry,
            "python".into(),
            vec!["ai".into()],
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn own_service_and_capabilities_stay_local() {
        let router = router(PeerRegistry::new("self".into()));
        assert!(matches!(
            router.decide("python").await.unwrap(),
            RouteDecision::Local
        ));
        assert!(matches!(
            router.decide("ai").await.unwrap(),
            RouteDecision::Local
        ));
    }

    #[tokio::test]
    async fn service_match_beats_capability_match() {
        let registry = PeerRegistry::new("self".into());
        registry.upsert(peer("by-cap", "other", &["go"])).await;
        registry.upsert(peer("by-name", "go", &[])).await;
        let router = router(registry);

        match router.decide("go").await.unwrap() {
            RouteDecision::Forward(p) => assert_eq!(p.node_id, "by-name"),
            RouteDecision::Local => panic!("expected forward"),
        }
    }

    #[tokio::test]
    async fn falls_back_to_capability_lookup() {
        let registry = PeerRegistry::new("self".into());
        registry.upsert(peer("by-cap", "other", &["go"])).await;
        let router = router(registry);

        match router.decide("go").await.unwrap() {
            RouteDecision::Forward(p) => assert_eq!(p.node_id, "by-cap"),
            RouteDecision::Local => panic!("expected forward"),
        }
    }

    #[tokio::test]
    async fn no_match_lists_known_services() {
        let registry = PeerRegistry::new("self".into());
        registry.upsert(peer("a", "go", &[])).await;
        let router = router(registry);

        match router.decide("elixir").await {
            Err(MeshError::NoRoute { target, available }) => {
                assert_eq!(target, "elixir");
                assert_eq!(available, vec!["go".to_string()]);
            }
            other => panic!("expected NoRoute, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwarding_to_a_dead_peer_reports_unreachable() {
        let registry = PeerRegistry::new("self".into());
        let dead = peer("dead", "go", &[]);
        registry.upsert(dead.clone()).await;
        let router = RequestRouter::new(
            registry,
            "python".into(),
            vec![],
            Duration::from_millis(300),
        );

        let err = router
            .forward(&dead, "/mesh/execute", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::PeerUnreachable { .. }));
    }
}
