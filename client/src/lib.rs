//! Consumer-side mesh facade.
//!
//! A UI or embedding process is not part of the mesh's authoritative
//! registry — it only probes the well-known ports, keeps a best-effort
//! peer mirror, and talks to whichever peer fits. On top of that it adds
//! what a consumer wants and a node does not: a response cache for code
//! generation, bounded request concurrency, retry with exponential
//! backoff, and running success/latency counters.
//!
//! The latency figure here is an incremental average over the client's
//! whole lifetime, deliberately unlike the server's windowed mean: a
//! consumer cares about its overall experience, a node about its recent
//! load.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;

use weft_protocol::cache::TtlCache;
use weft_protocol::history::ConversationStore;
use weft_protocol::peer::{PeerRecord, PeerRegistry};
use weft_protocol::types::{
    Announcement, ChatResponse, ChatTurn, DiscoverResponse, GenerateResponse, HealthReport,
    NodeId, Role, DISCOVERY_PORTS,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub node_id: NodeId,
    pub discovery_host: String,
    pub discovery_ports: Vec<u16>,
    pub discovery_timeout: Duration,
    pub request_timeout: Duration,
    pub max_cache_size: usize,
    pub cache_ttl: Duration,
    pub max_concurrency: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub health_poll_interval: Duration,
    pub history_max_turns: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_id: format!("client-{}", uuid::Uuid::new_v4()),
            discovery_host: "localhost".into(),
            discovery_ports: DISCOVERY_PORTS.to_vec(),
            discovery_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            max_cache_size: 1000,
            cache_ttl: Duration::from_secs(300),
            max_concurrency: 10,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
            health_poll_interval: Duration::from_secs(1),
            history_max_turns: 20,
        }
    }
}

/// Peer status updates from the background health poller.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Health {
        peer: PeerRecord,
        report: HealthReport,
    },
    Unreachable {
        peer: PeerRecord,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub session_id: String,
    pub response: String,
    pub model: String,
    /// Last two exchanges of the locally mirrored conversation.
    pub conversation: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientMetricsReport {
    pub total: u64,
    pub success: u64,
    pub errors: u64,
    pub average_time_ms: f64,
    pub peers: usize,
    pub services: usize,
    pub cache_size: usize,
    pub active_requests: usize,
    pub conversations: usize,
}

#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub total_peers: usize,
    pub healthy_peers: usize,
    pub services: Vec<String>,
    pub metrics: ClientMetricsReport,
}

#[derive(Default)]
struct MetricsInner {
    total: u64,
    success: u64,
    errors: u64,
    average_time_ms: f64,
}

impl MetricsInner {
    /// Incremental mean over completed calls: avg' = (avg*(n-1)+t)/n.
    fn record(&mut self, elapsed_ms: f64, ok: bool) {
        if ok {
            self.success += 1;
        } else {
            self.errors += 1;
        }
        let completed = (self.success + self.errors) as f64;
        self.average_time_ms =
            (self.average_time_ms * (completed - 1.0) + elapsed_ms) / completed;
    }
}

pub struct MeshClient {
    config: ClientConfig,
    http: reqwest::Client,
    registry: PeerRegistry,
    cache: TtlCache<GenerateResponse>,
    conversations: ConversationStore,
    limiter: Arc<Semaphore>,
    metrics: Arc<RwLock<MetricsInner>>,
    events_tx: broadcast::Sender<PeerEvent>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MeshClient {
    /// A facade with no peers yet; use [`MeshClient::connect`] for the
    /// probe-and-poll variant.
    pub fn new(config: ClientConfig) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            registry: PeerRegistry::new(config.node_id.clone()),
            cache: TtlCache::new(config.max_cache_size, config.cache_ttl),
            conversations: ConversationStore::new(
                config.history_max_turns,
                Duration::from_secs(24 * 60 * 60),
            ),
            limiter: Arc::new(Semaphore::new(config.max_concurrency)),
            metrics: Arc::new(RwLock::new(MetricsInner::default())),
            http: reqwest::Client::new(),
            events_tx,
            poller: Mutex::new(None),
            config,
        }
    }

    /// Probe the discovery ports, start the health poller, and hand the
    /// facade back. Unreachable ports are expected and skipped.
    pub async fn connect(config: ClientConfig) -> Self {
        let client = Self::new(config);
        let found = client.discover_peers().await;
        tracing::info!(
            peers = found,
            services = client.registry.service_count().await,
            "Mesh client ready"
        );
        client.start_health_poller().await;
        client
    }

    /// Concurrent best-effort probe of every discovery port. Returns the
    /// size of the peer table afterwards.
    ///
    /// A responder reports the peers *it* knows, never itself, so a node
    /// is learned through its neighbors' tables — with a single node up,
    /// a pure client sees nobody.
    pub async fn discover_peers(&self) -> usize {
        let probe = Announcement {
            announce: false,
            node_id: self.config.node_id.clone(),
            service_name: None,
            host: None,
            port: None,
            capabilities: vec![],
            timestamp: None,
        };

        let mut probes = Vec::new();
        for port in self.config.discovery_ports.clone() {
            let http = self.http.clone();
            let registry = self.registry.clone();
            let host = self.config.discovery_host.clone();
            let body = probe.clone();
            let timeout = self.config.discovery_timeout;
            probes.push(tokio::spawn(async move {
                let url = format!("http://{host}:{port}/mesh/discover");
                let Ok(resp) = http.post(&url).timeout(timeout).json(&body).send().await else {
                    return;
                };
                if !resp.status().is_success() {
                    return;
                }
                if let Ok(reply) = resp.json::<DiscoverResponse>().await {
                    registry.merge(&reply.peers).await;
                }
            }));
        }
        for probe in probes {
            let _ = probe.await;
        }

        self.registry.len().await
    }

    /// Subscribe to health-poller events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub async fn start_health_poller(&self) {
        let registry = self.registry.clone();
        let http = self.http.clone();
        let events_tx = self.events_tx.clone();
        let interval = self.config.health_poll_interval;
        let timeout = self.config.discovery_timeout;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                for peer in registry.snapshot().await {
                    let url = format!("{}/mesh/health", peer.base_url());
                    match http.get(&url).timeout(timeout).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            if let Ok(report) = resp.json::<HealthReport>().await {
                                registry.touch(&peer.node_id).await;
                                let _ = events_tx.send(PeerEvent::Health { peer, report });
                            }
                        }
                        Ok(resp) => {
                            registry.record_failure(&peer.node_id).await;
                            let _ = events_tx.send(PeerEvent::Unreachable {
                                peer,
                                error: format!("HTTP {}", resp.status()),
                            });
                        }
                        Err(e) => {
                            registry.record_failure(&peer.node_id).await;
                            let _ = events_tx.send(PeerEvent::Unreachable {
                                peer,
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
        });

        if let Some(old) = self.poller.lock().await.replace(handle) {
            old.abort();
        }
    }

    pub async fn shutdown(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.abort();
        }
        self.cache.clear().await;
        tracing::info!(node = %self.config.node_id, "Mesh client shut down");
    }

    /// Chat with the mesh: picks an `ai`-capable peer (any peer as a
    /// last resort) and mirrors the conversation locally.
    pub async fn chat(&self, message: &str, session_id: Option<String>, model: Option<String>)
        -> Result<ChatOutcome>
    {
        let session_id =
            session_id.unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));
        let model = model.unwrap_or_else(|| "default".into());

        let peer = match self.find_ai_peer().await {
            Some(peer) => peer,
            None => self
                .registry
                .snapshot()
                .await
                .into_iter()
                .next()
                .context("No AI-capable peers available")?,
        };

        let reply = self
            .send_request(
                &peer,
                "/mesh/ai/chat",
                &json!({
                    "sessionId": session_id,
                    "message": message,
                    "model": model,
                    "timestamp": Utc::now(),
                }),
            )
            .await?;
        let reply: ChatResponse =
            serde_json::from_value(reply).context("Unexpected chat response shape")?;

        self.conversations
            .append(&session_id, ChatTurn::now(Role::User, message))
            .await;
        self.conversations
            .append(&session_id, ChatTurn::now(Role::Assistant, &*reply.response))
            .await;

        Ok(ChatOutcome {
            conversation: self.conversations.tail(&session_id, 4).await,
            session_id,
            response: reply.response,
            model: reply.model,
        })
    }

    /// Generate code via the mesh, cached per `(language, prompt)`.
    pub async fn generate_code(
        &self,
        prompt: &str,
        language: &str,
        context: &str,
    ) -> Result<GenerateResponse> {
        let key = generate_cache_key(language, prompt);
        if let Some(cached) = self.cache.get(&key).await {
            tracing::debug!(language, "Code generation cache hit");
            return Ok(cached);
        }

        let peer = match self.registry.find_by_service(language).await {
            Some(peer) => peer,
            None => match self.find_ai_peer().await {
                Some(peer) => peer,
                None => bail!("No peer available for language: {language}"),
            },
        };

        let reply = self
            .send_request(
                &peer,
                "/mesh/ai/generate",
                &json!({
                    "prompt": prompt,
                    "language": language,
                    "context": context,
                    "options": {},
                }),
            )
            .await?;
        let reply: GenerateResponse =
            serde_json::from_value(reply).context("Unexpected generation response shape")?;

        self.cache.insert(key, reply.clone()).await;
        Ok(reply)
    }

    /// Run a snippet on the container registered for the language.
    pub async fn execute_code(
        &self,
        code: &str,
        language: &str,
        session_id: Option<String>,
    ) -> Result<Value> {
        let Some(peer) = self.registry.find_by_service(language).await else {
            bail!("No execution environment available for: {language}");
        };
        let session_id =
            session_id.unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));

        self.send_request(
            &peer,
            "/mesh/execute",
            &json!({
                "code": code,
                "language": language,
                "sessionId": session_id,
            }),
        )
        .await
    }

    pub async fn available_languages(&self) -> Vec<String> {
        self.registry.service_names().await
    }

    /// Fan out a health check to every known peer.
    pub async fn system_status(&self) -> SystemStatus {
        let peers = self.registry.snapshot().await;
        let total_peers = peers.len();

        let mut checks = Vec::new();
        for peer in peers {
            let http = self.http.clone();
            let timeout = self.config.discovery_timeout;
            checks.push(tokio::spawn(async move {
                let url = format!("{}/mesh/health", peer.base_url());
                matches!(
                    http.get(&url).timeout(timeout).send().await,
                    Ok(resp) if resp.status().is_success()
                )
            }));
        }

        let mut healthy_peers = 0;
        for check in checks {
            if check.await.unwrap_or(false) {
                healthy_peers += 1;
            }
        }

        SystemStatus {
            total_peers,
            healthy_peers,
            services: self.registry.service_names().await,
            metrics: self.metrics_report().await,
        }
    }

    pub async fn metrics_report(&self) -> ClientMetricsReport {
        let inner = self.metrics.read().await;
        ClientMetricsReport {
            total: inner.total,
            success: inner.success,
            errors: inner.errors,
            average_time_ms: inner.average_time_ms,
            peers: self.registry.len().await,
            services: self.registry.service_count().await,
            cache_size: self.cache.len().await,
            active_requests: self.config.max_concurrency - self.limiter.available_permits(),
            conversations: self.conversations.len().await,
        }
    }

    async fn find_ai_peer(&self) -> Option<PeerRecord> {
        let capable = self.registry.find_by_capability("ai").await;
        if capable.is_empty() {
            return None;
        }
        use rand::Rng;
        Some(capable[rand::thread_rng().gen_range(0..capable.len())].clone())
    }

    /// One mesh call: concurrency-bounded, retried with exponential
    /// backoff. When the budget is exhausted the original error is
    /// handed back for the caller to decide on a fallback.
    async fn send_request(
        &self,
        peer: &PeerRecord,
        endpoint: &str,
        body: &Value,
    ) -> Result<Value> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .context("request limiter closed")?;

        let mut delay = self.config.retry_base_delay;
        let mut last_err = None;
        for attempt in 0..self.config.retry_attempts.max(1) {
            self.metrics.write().await.total += 1;
            let started = Instant::now();
            match self.try_request(peer, endpoint, body).await {
                Ok(value) => {
                    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                    self.metrics.write().await.record(elapsed, true);
                    return Ok(value);
                }
                Err(e) => {
                    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                    self.metrics.write().await.record(elapsed, false);
                    tracing::debug!(
                        peer = %peer.node_id,
                        endpoint,
                        attempt,
                        error = %e,
                        "Mesh request failed"
                    );
                    last_err = Some(e);
                    if attempt + 1 < self.config.retry_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("mesh request failed")))
    }

    async fn try_request(&self, peer: &PeerRecord, endpoint: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", peer.base_url(), endpoint);
        let resp = self
            .http
            .post(&url)
            .timeout(self.config.request_timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach peer {}", peer.node_id))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("Peer {} returned HTTP {status}", peer.node_id);
        }
        resp.json::<Value>()
            .await
            .context("Invalid JSON response")
    }
}

fn generate_cache_key(language: &str, prompt: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    prompt.hash(&mut hasher);
    format!("code:{language}:{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> ClientConfig {
        ClientConfig {
            discovery_ports: vec![],
            retry_base_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        }
    }

    fn peer_at(port: u16, service: &str, caps: &[&str]) -> PeerRecord {
        PeerRecord {
            node_id: format!("{service}-{port}"),
            service_name: service.into(),
            host: "127.0.0.1".into(),
            port,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            last_seen: Utc::now(),
        }
    }

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[test]
    fn incremental_average_is_over_completed_calls() {
        let mut inner = MetricsInner::default();
        inner.record(10.0, true);
        inner.record(20.0, true);
        assert!((inner.average_time_ms - 15.0).abs() < 1e-9);

        // Failures feed the same average
        inner.record(30.0, false);
        assert!((inner.average_time_ms - 20.0).abs() < 1e-9);
        assert_eq!(inner.success, 2);
        assert_eq!(inner.errors, 1);
    }

    #[tokio::test]
    async fn chat_without_peers_reports_no_ai() {
        let client = MeshClient::new(test_config());
        let err = client.chat("hi", None, None).await.unwrap_err();
        assert!(err.to_string().contains("No AI-capable peers"));
    }

    #[tokio::test]
    async fn execute_without_service_reports_missing_environment() {
        let client = MeshClient::new(test_config());
        let err = client
            .execute_code("x", "elixir", None)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("No execution environment available for: elixir"));
    }

    #[tokio::test]
    async fn retries_with_backoff_until_a_peer_answers() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let app = Router::new().route(
            "/mesh/execute",
            post(|| async {
                // Fail the first two attempts, then answer.
                if CALLS.fetch_add(1, Ordering::SeqCst) < 2 {
                    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})))
                } else {
                    (axum::http::StatusCode::OK, Json(json!({ "success": true })))
                }
            }),
        );
        let port = serve(app).await;

        let client = MeshClient::new(test_config());
        client.registry.upsert(peer_at(port, "go", &[])).await;

        let reply = client.execute_code("x", "go", None).await.unwrap();
        assert_eq!(reply["success"], true);

        let metrics = client.metrics_report().await;
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.errors, 2);
        assert_eq!(metrics.success, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_original_error() {
        let client = MeshClient::new(ClientConfig {
            retry_attempts: 2,
            request_timeout: Duration::from_millis(300),
            ..test_config()
        });
        client.registry.upsert(peer_at(59_911, "go", &[])).await;

        let err = client.execute_code("x", "go", None).await.unwrap_err();
        assert!(err.to_string().contains("Failed to reach peer"));
        assert_eq!(client.metrics_report().await.errors, 2);
    }

    #[tokio::test]
    async fn generate_code_caches_by_language_and_prompt() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let app = Router::new().route(
            "/mesh/ai/generate",
            post(|| async {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Json(json!({
                    "success": true,
                    "code": "print(1)",
                    "language": "python",
                    "metadata": { "lines": 1, "characters": 8, "generated": Utc::now() },
                }))
            }),
        );
        let port = serve(app).await;

        let client = MeshClient::new(test_config());
        client
            .registry
            .upsert(peer_at(port, "python", &["python"]))
            .await;

        let first = client.generate_code("one liner", "python", "").await.unwrap();
        let second = client.generate_code("one liner", "python", "").await.unwrap();
        assert_eq!(first.code, second.code);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        // A different prompt misses the cache.
        client.generate_code("other", "python", "").await.unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(client.metrics_report().await.cache_size, 2);
    }

    #[tokio::test]
    async fn chat_mirrors_the_conversation_locally() {
        let app = Router::new().route(
            "/mesh/ai/chat",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "success": true,
                    "response": "pong",
                    "sessionId": body["sessionId"],
                    "model": body["model"],
                    "history": [],
                }))
            }),
        );
        let port = serve(app).await;

        let client = MeshClient::new(test_config());
        client
            .registry
            .upsert(peer_at(port, "nodejs", &["ai"]))
            .await;

        let mut outcome = None;
        for i in 0..3 {
            outcome = Some(
                client
                    .chat(&format!("ping {i}"), Some("s1".into()), None)
                    .await
                    .unwrap(),
            );
        }
        let outcome = outcome.unwrap();
        assert_eq!(outcome.response, "pong");
        // Last two exchanges only
        assert_eq!(outcome.conversation.len(), 4);
        assert_eq!(outcome.conversation[2].content, "ping 2");
        assert_eq!(client.conversations.len().await, 1);
    }
}
