use axum::{
    extract::{OriginalUri, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};

use weft_protocol::{MeshError, MeshNode};

pub fn create_router(node: Arc<MeshNode>) -> Router {
    Router::new()
        .route("/mesh/discover", post(discover))
        .route("/mesh/message", post(message))
        .route("/mesh/ai/chat", post(ai_chat))
        .route("/mesh/ai/generate", post(ai_generate))
        .route("/mesh/execute", post(execute))
        // Read-only endpoints also accept POST: client facades poll them
        // with empty POST bodies.
        .route("/mesh/health", get(health).post(health))
        .route("/mesh/metrics", get(metrics).post(metrics))
        .route("/mesh/peers", get(peers).post(peers))
        .fallback(unknown_endpoint)
        .layer(middleware::from_fn_with_state(
            node.clone(),
            track_metrics,
        ))
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)) // 10MB
        .layer(CorsLayer::permissive())
        .with_state(node)
}

/// Every request is counted and timed, success or failure; the error
/// counter moves only when a handler fault surfaces as a 5xx.
async fn track_metrics(
    State(node): State<Arc<MeshNode>>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let response = next.run(req).await;
    node.metrics.record_request(started.elapsed()).await;
    if response.status().is_server_error() {
        node.metrics.record_error().await;
    }
    response
}

/// Bodies are parsed leniently: an unparseable body is wrapped as
/// `{"raw": ...}` and left to the endpoint's own validation.
fn parse_body(raw: &str) -> Value {
    if raw.is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "raw": raw }))
}

fn respond(result: Result<Value, MeshError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(MeshError::BadRequest(reason)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": reason })),
        )
            .into_response(),
        // Routed failures are normally absorbed inside the handlers;
        // anything else is a handler fault. The node keeps serving.
        Err(err) if err.is_routed() => Json(json!({ "error": err.to_string() })).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Handler fault");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn discover(State(node): State<Arc<MeshNode>>, body: String) -> Response {
    respond(node.handle_discover(parse_body(&body)).await)
}

async fn message(State(node): State<Arc<MeshNode>>, body: String) -> Response {
    respond(node.handle_message(parse_body(&body)).await)
}

async fn ai_chat(State(node): State<Arc<MeshNode>>, body: String) -> Response {
    respond(node.handle_chat(parse_body(&body)).await)
}

async fn ai_generate(State(node): State<Arc<MeshNode>>, body: String) -> Response {
    respond(node.handle_generate(parse_body(&body)).await)
}

async fn execute(State(node): State<Arc<MeshNode>>, body: String) -> Response {
    respond(node.handle_execute(parse_body(&body)).await)
}

async fn health(State(node): State<Arc<MeshNode>>) -> Response {
    Json(node.health().await).into_response()
}

async fn metrics(State(node): State<Arc<MeshNode>>) -> Response {
    Json(node.metrics_report().await).into_response()
}

async fn peers(State(node): State<Arc<MeshNode>>) -> Response {
    Json(node.peers_report().await).into_response()
}

/// Unknown paths get a structured payload with HTTP 200, not a bare 404:
/// mesh clients parse the JSON body regardless of status, and the body
/// names the path so misrouted callers can tell what happened.
async fn unknown_endpoint(OriginalUri(uri): OriginalUri) -> Response {
    Json(json!({ "error": "Unknown endpoint", "path": uri.path() })).into_response()
}
