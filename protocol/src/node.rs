use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::ai::{
    default_models, ChatResponder, CodeExecutor, CodeGenerator, MeshView, MockExecutor, ModelInfo,
    TemplateGenerator, TemplateResponder,
};
use crate::cache::TtlCache;
use crate::error::MeshError;
use crate::history::ConversationStore;
use crate::metrics::{resident_memory_bytes, NodeMetrics};
use crate::peer::{PeerRecord, PeerRegistry};
use crate::router::{RequestRouter, RouteDecision};
use crate::types::*;

/// A message that was processed on this node rather than forwarded,
/// re-broadcast to in-process subscribers.
#[derive(Debug, Clone)]
pub struct LocalMessage {
    pub message: Value,
    pub message_type: String,
    pub from: Option<NodeId>,
}

/// One mesh node: registry, stores, metrics, and the request handlers.
///
/// Everything lives on the instance — no process-wide singletons — so a
/// test can run several nodes side by side and tear each down cleanly.
pub struct MeshNode {
    pub config: MeshConfig,
    pub registry: PeerRegistry,
    pub history: ConversationStore,
    pub cache: TtlCache<Value>,
    pub metrics: NodeMetrics,
    pub(crate) router: RequestRouter,
    pub(crate) http: reqwest::Client,
    models: HashMap<String, ModelInfo>,
    chat: Option<Arc<dyn ChatResponder>>,
    codegen: Option<Arc<dyn CodeGenerator>>,
    executor: Arc<dyn CodeExecutor>,
    messages_tx: broadcast::Sender<LocalMessage>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Node with the built-in template strategies.
    pub fn new(config: MeshConfig) -> Arc<Self> {
        Self::with_strategies(
            config,
            Some(Arc::new(TemplateResponder) as Arc<dyn ChatResponder>),
            Some(Arc::new(TemplateGenerator) as Arc<dyn CodeGenerator>),
            Arc::new(MockExecutor),
        )
    }

    /// Node with injected strategies. Passing `None` for the responder or
    /// generator makes the node forward those requests to an `ai`-capable
    /// peer instead of serving them.
    pub fn with_strategies(
        config: MeshConfig,
        chat: Option<Arc<dyn ChatResponder>>,
        codegen: Option<Arc<dyn CodeGenerator>>,
        executor: Arc<dyn CodeExecutor>,
    ) -> Arc<Self> {
        let registry = PeerRegistry::new(config.node_id.clone());
        let router = RequestRouter::new(
            registry.clone(),
            config.service_name.clone(),
            config.capabilities.clone(),
            config.forward_timeout,
        );
        let (messages_tx, _) = broadcast::channel(64);

        tracing::info!(
            node = %config.node_id,
            service = %config.service_name,
            port = config.port,
            "Mesh node created"
        );

        Arc::new(Self {
            registry,
            history: ConversationStore::new(config.history_max_turns, config.history_retention),
            cache: TtlCache::new(config.cache_capacity, config.cache_ttl),
            metrics: NodeMetrics::new(config.latency_window),
            router,
            http: reqwest::Client::new(),
            models: default_models(),
            chat,
            codegen,
            executor,
            messages_tx,
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Subscribe to messages processed locally by `/mesh/message`.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<LocalMessage> {
        self.messages_tx.subscribe()
    }

    // --- Endpoint handlers. Bodies arrive as raw JSON and are validated
    // here; routed failures become caller-facing payloads, only
    // BadRequest and genuine handler faults escape to the transport. ---

    pub async fn handle_discover(&self, body: Value) -> Result<Value, MeshError> {
        let req: Announcement = serde_json::from_value(body).map_err(MeshError::bad_request)?;

        if req.announce {
            let (Some(service_name), Some(port)) = (req.service_name.clone(), req.port) else {
                return Err(MeshError::BadRequest(
                    "announce requires serviceName and port".into(),
                ));
            };
            self.registry
                .upsert(PeerRecord {
                    node_id: req.node_id,
                    service_name,
                    host: req.host.unwrap_or_else(|| "localhost".into()),
                    port,
                    capabilities: req.capabilities,
                    last_seen: Utc::now(),
                })
                .await;
        }

        let resp = DiscoverResponse {
            success: true,
            node_id: self.config.node_id.clone(),
            service: self.config.service_name.clone(),
            peers: self.registry.snapshot().await,
        };
        Ok(serde_json::to_value(resp).map_err(anyhow::Error::from)?)
    }

    pub async fn handle_message(&self, body: Value) -> Result<Value, MeshError> {
        let req: MessageRequest =
            serde_json::from_value(body.clone()).map_err(MeshError::bad_request)?;

        // Explicit node target: forward unless it is us.
        if let Some(target_node) = &req.target_node {
            if *target_node != self.config.node_id {
                return match self.router.forward_to_node(target_node, "/mesh/message", &body).await
                {
                    Ok(reply) => Ok(reply),
                    Err(MeshError::NoRoute { .. }) => {
                        Ok(json!({ "error": format!("Peer {target_node} not found") }))
                    }
                    Err(e) if e.is_routed() => {
                        tracing::warn!(peer = %target_node, error = %e, "Message forward failed");
                        Ok(json!({ "error": format!("Failed to forward message: {e}") }))
                    }
                    Err(e) => Err(e),
                };
            }
        } else if let Some(target_service) = &req.target_service {
            match self.router.decide(target_service).await {
                Ok(RouteDecision::Local) => {}
                Ok(RouteDecision::Forward(peer)) => {
                    return match self.router.forward(&peer, "/mesh/message", &body).await {
                        Ok(reply) => Ok(reply),
                        Err(e) if e.is_routed() => {
                            tracing::warn!(peer = %peer.node_id, error = %e, "Message forward failed");
                            Ok(json!({ "error": format!("Failed to forward message: {e}") }))
                        }
                        Err(e) => Err(e),
                    };
                }
                Err(MeshError::NoRoute { target, available }) => {
                    return Ok(json!({
                        "error": format!("No route to service: {target}"),
                        "availableServices": available,
                    }));
                }
                Err(e) => return Err(e),
            }
        }

        // Ours to process. Subscribers may or may not exist.
        let _ = self.messages_tx.send(LocalMessage {
            message: req.message,
            message_type: req.message_type,
            from: req.from,
        });

        Ok(json!({
            "success": true,
            "processed": true,
            "nodeId": self.config.node_id,
            "timestamp": Utc::now(),
        }))
    }

    pub async fn handle_chat(&self, body: Value) -> Result<Value, MeshError> {
        let req: ChatRequest =
            serde_json::from_value(body.clone()).map_err(MeshError::bad_request)?;

        let Some(responder) = &self.chat else {
            // No responder installed: hand the session to an ai-capable peer.
            return match self.registry.find_by_capability("ai").await.into_iter().next() {
                Some(peer) => match self.router.forward(&peer, "/mesh/ai/chat", &body).await {
                    Ok(reply) => Ok(reply),
                    Err(e) if e.is_routed() => {
                        tracing::warn!(peer = %peer.node_id, error = %e, "Chat forward failed");
                        Ok(json!({ "error": format!("Failed to forward chat: {e}") }))
                    }
                    Err(e) => Err(e),
                },
                None => Ok(json!({
                    "error": "No route to capability: ai",
                    "availableServices": self.registry.service_names().await,
                })),
            };
        };

        self.history
            .append(&req.session_id, ChatTurn::now(Role::User, &*req.message))
            .await;

        let view = MeshView {
            services: self.registry.service_names().await,
            peer_count: self.registry.len().await,
        };
        let turns = self.history.get(&req.session_id).await;
        let reply = responder.respond(&req.message, &turns, &req.model, &view);

        self.history
            .append(&req.session_id, ChatTurn::now(Role::Assistant, &*reply))
            .await;

        let resp = ChatResponse {
            success: true,
            response: reply,
            session_id: req.session_id.clone(),
            model: req.model,
            history: self.history.tail(&req.session_id, 5).await,
        };
        Ok(serde_json::to_value(resp).map_err(anyhow::Error::from)?)
    }

    pub async fn handle_generate(&self, body: Value) -> Result<Value, MeshError> {
        let req: GenerateRequest =
            serde_json::from_value(body.clone()).map_err(MeshError::bad_request)?;

        let Some(generator) = &self.codegen else {
            return match self.router.decide(&req.language).await {
                Ok(RouteDecision::Forward(peer)) => {
                    match self.router.forward(&peer, "/mesh/ai/generate", &body).await {
                        Ok(reply) => Ok(reply),
                        Err(e) if e.is_routed() => {
                            tracing::warn!(peer = %peer.node_id, error = %e, "Generate forward failed");
                            Ok(json!({ "error": format!("Failed to forward generation: {e}") }))
                        }
                        Err(e) => Err(e),
                    }
                }
                Ok(RouteDecision::Local) => Err(MeshError::Handler(anyhow::anyhow!(
                    "code generator not configured"
                ))),
                Err(MeshError::NoRoute { target, available }) => Ok(json!({
                    "error": format!("No route to service: {target}"),
                    "availableServices": available,
                })),
                Err(e) => Err(e),
            };
        };

        let key = generate_cache_key(&req.language, &req.prompt);
        if let Some(cached) = self.cache.get(&key).await {
            tracing::debug!(language = %req.language, "Code generation cache hit");
            return Ok(cached);
        }

        let code = generator.generate(&req.prompt, &req.language, &req.context);
        let resp = GenerateResponse {
            success: true,
            metadata: GenerateMetadata {
                lines: code.lines().count(),
                characters: code.chars().count(),
                generated: Utc::now(),
            },
            code,
            language: req.language,
        };
        let value = serde_json::to_value(resp).map_err(anyhow::Error::from)?;
        self.cache.insert(key, value.clone()).await;
        Ok(value)
    }

    pub async fn handle_execute(&self, body: Value) -> Result<Value, MeshError> {
        let req: ExecuteRequest =
            serde_json::from_value(body.clone()).map_err(MeshError::bad_request)?;

        match self.router.decide(&req.language).await {
            Ok(RouteDecision::Local) => {
                let outcome = self.executor.execute(&req.code, &req.language);
                let resp = ExecuteResponse {
                    success: outcome.error.is_empty(),
                    output: outcome.output,
                    error: outcome.error,
                    language: req.language,
                    session_id: req.session_id,
                    executed_at: Utc::now(),
                    execution_time: outcome.duration_ms,
                };
                Ok(serde_json::to_value(resp).map_err(anyhow::Error::from)?)
            }
            Ok(RouteDecision::Forward(peer)) => {
                match self.router.forward(&peer, "/mesh/execute", &body).await {
                    Ok(reply) => Ok(reply),
                    Err(e) if e.is_routed() => {
                        tracing::warn!(peer = %peer.node_id, error = %e, "Execution forward failed");
                        Ok(json!({ "error": format!("Execution forwarding failed: {e}") }))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(MeshError::NoRoute { target, available }) => Ok(json!({
                "error": format!("No available container for language: {target}"),
                "availableLanguages": available,
            })),
            Err(e) => Err(e),
        }
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            node_id: self.config.node_id.clone(),
            service: self.config.service_name.clone(),
            status: "healthy".into(),
            uptime: self.metrics.uptime_ms(),
            peers: self.registry.len().await,
            services: self.registry.service_count().await,
            ai_models: self.models.len(),
            conversations: self.history.len().await,
        }
    }

    pub async fn metrics_report(&self) -> MetricsReport {
        MetricsReport {
            messages: self.metrics.messages().await,
            errors: self.metrics.errors().await,
            average_response_time: self.metrics.average_response_time().await,
            uptime: self.metrics.uptime_ms(),
            memory_usage: resident_memory_bytes().map(|rss| MemoryUsage { rss }),
            peers: self.registry.len().await,
            active_conversations: self.history.len().await,
        }
    }

    pub async fn peers_report(&self) -> PeersReport {
        PeersReport {
            node_id: self.config.node_id.clone(),
            peers: self.registry.snapshot().await,
            services: self.registry.service_entries().await,
        }
    }
}

fn generate_cache_key(language: &str, prompt: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    prompt.hash(&mut hasher);
    format!("code:{language}:{:x}", hasher.finish())
}
