//! Peer discovery: announce broadcasts, health pings, staleness sweeps.
//!
//! There is no central coordinator. Every node announces itself to the
//! well-known port list on a fixed cadence; whoever answers sends back
//! its full peer table, which is merged in. Ports with nothing behind
//! them are an expected non-error condition and are ignored.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::node::MeshNode;
use crate::types::{Announcement, DiscoverResponse};

impl MeshNode {
    /// Start the periodic work: announce + ping on the announce cadence,
    /// store sweeps on the sweep cadence. The spawned tasks are owned by
    /// the node and cancelled as a group by [`MeshNode::shutdown`].
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(node.config.announce_interval);
            loop {
                timer.tick().await;
                node.announce_once().await;
                node.ping_and_sweep().await;
            }
        }));

        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(node.config.sweep_interval);
            loop {
                timer.tick().await;
                let idle = node.history.sweep_idle().await;
                let expired = node.cache.sweep_expired().await;
                if idle > 0 || expired > 0 {
                    tracing::debug!(
                        sessions = idle,
                        cache_entries = expired,
                        "Swept expired store entries"
                    );
                }
            }
        }));

        tracing::info!(
            service = %self.config.service_name,
            ports = self.config.discovery_ports.len(),
            "Discovery started"
        );
    }

    /// Cancel the periodic tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::info!(node = %self.config.node_id, "Mesh node shut down");
    }

    /// Announce ourselves to every well-known port, concurrently. Each
    /// probe carries its own timeout, so one announce round costs at most
    /// one timeout regardless of how many ports are dead.
    pub async fn announce_once(&self) {
        let announcement = Announcement {
            announce: true,
            node_id: self.config.node_id.clone(),
            service_name: Some(self.config.service_name.clone()),
            host: Some(self.config.host.clone()),
            port: Some(self.config.port),
            capabilities: self.config.capabilities.clone(),
            timestamp: Some(Utc::now()),
        };

        let mut probes = Vec::new();
        for port in self.config.discovery_ports.clone() {
            if port == self.config.port {
                continue;
            }
            let http = self.http.clone();
            let registry = self.registry.clone();
            let body = announcement.clone();
            let timeout = self.config.announce_timeout;
            probes.push(tokio::spawn(async move {
                match announce_to_port(&http, port, &body, timeout).await {
                    Some(reply) => {
                        registry.merge(&reply.peers).await;
                    }
                    None => {
                        // Nothing listening there right now.
                        tracing::trace!(port, "Discovery port silent");
                    }
                }
            }));
        }

        for probe in probes {
            let _ = probe.await;
        }
    }

    /// Ping every known peer's health endpoint, then evict by age.
    /// Ping failures only mark the peer for metrics — a flapping peer is
    /// kept until the staleness sweep catches it.
    pub async fn ping_and_sweep(&self) {
        let peers = self.registry.snapshot().await;

        let mut pings = Vec::new();
        for peer in peers {
            let http = self.http.clone();
            let registry = self.registry.clone();
            let timeout = self.config.ping_timeout;
            pings.push(tokio::spawn(async move {
                let url = format!("{}/mesh/health", peer.base_url());
                let alive = matches!(
                    http.get(&url).timeout(timeout).send().await,
                    Ok(resp) if resp.status().is_success()
                );
                if alive {
                    registry.touch(&peer.node_id).await;
                } else {
                    let failures = registry.record_failure(&peer.node_id).await;
                    tracing::debug!(
                        peer = %peer.service_name,
                        node = %peer.node_id,
                        failures,
                        "Health ping failed"
                    );
                }
            }));
        }
        for ping in pings {
            let _ = ping.await;
        }

        for removed in self
            .registry
            .sweep_stale(self.config.staleness_threshold)
            .await
        {
            tracing::info!(
                peer = %removed.service_name,
                node = %removed.node_id,
                "Removed stale peer"
            );
        }
    }
}

async fn announce_to_port(
    http: &reqwest::Client,
    port: u16,
    announcement: &Announcement,
    timeout: Duration,
) -> Option<DiscoverResponse> {
    let url = format!("http://localhost:{port}/mesh/discover");
    let resp = http
        .post(&url)
        .timeout(timeout)
        .json(announcement)
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<DiscoverResponse>().await.ok()
}
