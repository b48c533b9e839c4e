use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::types::{NodeId, ServiceEntry};

/// A known peer, in the shape it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    #[serde(rename = "id")]
    pub node_id: NodeId,
    #[serde(rename = "service")]
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_seen);
        age.num_milliseconds() > max_age.as_millis() as i64
    }
}

struct PeerState {
    record: PeerRecord,
    failed_pings: u32,
}

struct Inner {
    peers: HashMap<NodeId, PeerState>,
    /// Derived index: service name → current holder. Not a multimap —
    /// a fresh registration for an already-known service supersedes the
    /// previous holder, which stays reachable only by capability lookup.
    services: HashMap<String, NodeId>,
}

/// The peer registry — thread-safe store of known peers plus the derived
/// service-name index. One registry per node instance, no globals.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RwLock<Inner>>,
    self_id: NodeId,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                peers: HashMap::new(),
                services: HashMap::new(),
            })),
            self_id,
        }
    }

    /// Insert or replace a peer from a direct announcement. The service
    /// slot is repointed unconditionally (last write wins).
    pub async fn upsert(&self, record: PeerRecord) {
        if record.node_id == self.self_id {
            return;
        }

        let mut inner = self.inner.write().await;
        inner
            .services
            .insert(record.service_name.clone(), record.node_id.clone());
        if !inner.peers.contains_key(&record.node_id) {
            tracing::info!(
                peer = %record.service_name,
                node = %record.node_id,
                "Discovered peer"
            );
        }
        let id = record.node_id.clone();
        inner.peers.insert(
            id,
            PeerState {
                record,
                failed_pings: 0,
            },
        );
    }

    /// Merge gossiped records (from an announce reply). An entry only
    /// replaces what we have if its `last_seen` is newer, so a stale
    /// gossip round cannot roll a peer backwards.
    pub async fn merge(&self, records: &[PeerRecord]) {
        for record in records {
            if record.node_id == self.self_id {
                continue;
            }
            let newer = {
                let inner = self.inner.read().await;
                match inner.peers.get(&record.node_id) {
                    Some(state) => record.last_seen > state.record.last_seen,
                    None => true,
                }
            };
            if newer {
                self.upsert(record.clone()).await;
            }
        }
    }

    /// Remove a peer. Clears its service slot only if it is still the
    /// current holder.
    pub async fn remove(&self, node_id: &str) -> Option<PeerRecord> {
        let mut inner = self.inner.write().await;
        let state = inner.peers.remove(node_id)?;
        let name = state.record.service_name.clone();
        if inner.services.get(&name).map(String::as_str) == Some(node_id) {
            inner.services.remove(&name);
        }
        Some(state.record)
    }

    /// Refresh a peer's `last_seen` after a successful contact.
    pub async fn touch(&self, node_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(state) = inner.peers.get_mut(node_id) {
            state.record.last_seen = Utc::now();
            state.failed_pings = 0;
        }
    }

    /// Count a failed contact. Feeds metrics only — eviction is driven
    /// exclusively by `last_seen` age, so a flapping peer is tolerated
    /// instead of thrashed in and out of the table.
    pub async fn record_failure(&self, node_id: &str) -> u32 {
        let mut inner = self.inner.write().await;
        match inner.peers.get_mut(node_id) {
            Some(state) => {
                state.failed_pings += 1;
                state.failed_pings
            }
            None => 0,
        }
    }

    /// Remove every peer older than `max_age`; returns the removed set.
    pub async fn sweep_stale(&self, max_age: Duration) -> Vec<PeerRecord> {
        let mut inner = self.inner.write().await;
        let stale: Vec<NodeId> = inner
            .peers
            .values()
            .filter(|s| s.record.is_stale(max_age))
            .map(|s| s.record.node_id.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(state) = inner.peers.remove(&id) {
                let name = state.record.service_name.clone();
                if inner.services.get(&name).map(String::as_str) == Some(id.as_str()) {
                    inner.services.remove(&name);
                }
                removed.push(state.record);
            }
        }
        removed
    }

    pub async fn get(&self, node_id: &str) -> Option<PeerRecord> {
        let inner = self.inner.read().await;
        inner.peers.get(node_id).map(|s| s.record.clone())
    }

    /// The single current holder of a service name, if any.
    pub async fn find_by_service(&self, name: &str) -> Option<PeerRecord> {
        let inner = self.inner.read().await;
        let id = inner.services.get(name)?;
        inner.peers.get(id).map(|s| s.record.clone())
    }

    /// All peers advertising a capability tag.
    pub async fn find_by_capability(&self, tag: &str) -> Vec<PeerRecord> {
        let inner = self.inner.read().await;
        inner
            .peers
            .values()
            .filter(|s| s.record.has_capability(tag))
            .map(|s| s.record.clone())
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        let inner = self.inner.read().await;
        inner.peers.values().map(|s| s.record.clone()).collect()
    }

    pub async fn service_names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.services.keys().cloned().collect()
    }

    pub async fn service_entries(&self) -> Vec<ServiceEntry> {
        let inner = self.inner.read().await;
        inner
            .services
            .iter()
            .filter_map(|(name, id)| {
                let state = inner.peers.get(id)?;
                Some(ServiceEntry {
                    name: name.clone(),
                    node_id: id.clone(),
                    host: state.record.host.clone(),
                    port: state.record.port,
                })
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.peers.is_empty()
    }

    pub async fn service_count(&self) -> usize {
        self.inner.read().await.services.len()
    }
}
