use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique node identifier
pub type NodeId = String;

/// Static service → port convention. Stands in for multicast/DNS-SD:
/// a node serving one of these names listens on its well-known port,
/// and everyone announces to the full list.
pub const SERVICE_PORTS: &[(&str, u16)] = &[
    ("nodejs", 3000),
    ("python", 5000),
    ("java", 8080),
    ("go", 8082),
    ("php", 8085),
    ("rust", 8090),
    ("zig", 8087),
    ("crystal", 8094),
    ("elixir", 8096),
    ("fortran", 8097),
    ("modern-ui", 8080),
];

/// Ports probed during discovery broadcasts.
pub const DISCOVERY_PORTS: &[u16] = &[
    3000, 4000, 5000, 8080, 8082, 8085, 8087, 8090, 8094, 8096, 8097,
];

/// Well-known port for a service name, if it has one.
pub fn well_known_port(service_name: &str) -> Option<u16> {
    SERVICE_PORTS
        .iter()
        .find(|(name, _)| *name == service_name)
        .map(|(_, port)| *port)
}

/// Listening port for a service: the well-known port, else a random one
/// in the 8000-8999 range.
pub fn detect_port(service_name: &str) -> u16 {
    well_known_port(service_name).unwrap_or_else(|| {
        use rand::Rng;
        8000 + rand::thread_rng().gen_range(0..1000)
    })
}

/// One turn of an AI conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl ChatTurn {
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// --- Wire types, one pair per endpoint ---

/// Body of `/mesh/discover`. With `announce: true` this registers the
/// sender; with `announce: false` it is a passive peer-list request
/// (the form client facades send, which carry no address of their own).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    #[serde(default)]
    pub announce: bool,
    pub node_id: NodeId,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub success: bool,
    pub node_id: NodeId,
    pub service: String,
    pub peers: Vec<crate::peer::PeerRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    #[serde(default)]
    pub target_service: Option<String>,
    #[serde(default)]
    pub target_node: Option<NodeId>,
    pub message: serde_json::Value,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub from: Option<NodeId>,
}

fn default_message_type() -> String {
    "general".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "default".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub success: bool,
    pub response: String,
    pub session_id: String,
    pub model: String,
    /// Last 5 turns of the session.
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    pub language: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub success: bool,
    pub code: String,
    pub language: String,
    pub metadata: GenerateMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateMetadata {
    pub lines: usize,
    pub characters: usize,
    pub generated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub language: String,
    pub session_id: Option<String>,
    pub executed_at: DateTime<Utc>,
    /// Wall time of the execution in milliseconds.
    pub execution_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub node_id: NodeId,
    pub service: String,
    pub status: String,
    /// Milliseconds since the node started.
    pub uptime: u64,
    pub peers: usize,
    pub services: usize,
    pub ai_models: usize,
    pub conversations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub messages: u64,
    pub errors: u64,
    /// Arithmetic mean over the last 100 response-time samples, in ms.
    pub average_response_time: f64,
    pub uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<MemoryUsage>,
    pub peers: usize,
    pub active_conversations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeersReport {
    pub node_id: NodeId,
    pub peers: Vec<crate::peer::PeerRecord>,
    pub services: Vec<ServiceEntry>,
}

/// One row of the derived service-name index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub name: String,
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

/// Configuration for one mesh node.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// This node's unique ID
    pub node_id: NodeId,
    /// Logical service this node advertises (e.g. "python", "go")
    pub service_name: String,
    /// Address other nodes can reach us at
    pub host: String,
    /// Port the mesh endpoint listens on
    pub port: u16,
    /// Capability tags used as a routing fallback (e.g. language names, "ai")
    pub capabilities: Vec<String>,
    /// Ports probed by discovery broadcasts
    pub discovery_ports: Vec<u16>,
    /// How often to announce and ping (30s)
    pub announce_interval: Duration,
    /// Peers not seen for this long are evicted (120s)
    pub staleness_threshold: Duration,
    /// Cadence of the store sweeps (60s)
    pub sweep_interval: Duration,
    /// Sessions idle longer than this are dropped (24h)
    pub history_retention: Duration,
    /// Conversation turns kept per session
    pub history_max_turns: usize,
    /// Response-time samples kept for the rolling mean
    pub latency_window: usize,
    /// Response cache entry cap
    pub cache_capacity: usize,
    /// Response cache default TTL
    pub cache_ttl: Duration,
    /// Per-port timeout during an announce broadcast
    pub announce_timeout: Duration,
    /// Timeout of a health ping
    pub ping_timeout: Duration,
    /// Timeout of a forwarded request
    pub forward_timeout: Duration,
}

impl MeshConfig {
    /// Config for a named service on its well-known port.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let port = detect_port(&service_name);
        Self {
            service_name,
            port,
            ..Self::default()
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            service_name: "unknown".into(),
            host: "localhost".into(),
            port: 8000,
            capabilities: vec![],
            discovery_ports: DISCOVERY_PORTS.to_vec(),
            announce_interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(60),
            history_retention: Duration::from_secs(24 * 60 * 60),
            history_max_turns: 20,
            latency_window: 100,
            cache_capacity: 1000,
            cache_ttl: Duration::from_secs(300),
            announce_timeout: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(3),
            forward_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_ports_resolve() {
        assert_eq!(well_known_port("python"), Some(5000));
        assert_eq!(well_known_port("go"), Some(8082));
        assert_eq!(well_known_port("cobol"), None);
    }

    #[test]
    fn detect_port_falls_back_to_ephemeral_range() {
        let port = detect_port("cobol");
        assert!((8000..9000).contains(&port));
    }

    #[test]
    fn announcement_accepts_passive_probe() {
        // Client facades send only {announce, nodeId}
        let probe: Announcement =
            serde_json::from_value(serde_json::json!({
                "announce": false,
                "nodeId": "client-1",
            }))
            .unwrap();
        assert!(!probe.announce);
        assert!(probe.service_name.is_none());
        assert!(probe.capabilities.is_empty());
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let req = MessageRequest {
            target_service: Some("go".into()),
            target_node: None,
            message: serde_json::json!("hi"),
            message_type: "general".into(),
            from: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("targetService").is_some());
        assert!(v.get("messageType").is_some());
    }
}
