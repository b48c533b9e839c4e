use crate::types::NodeId;

/// Failure taxonomy of the mesh core.
///
/// Routed failures (`NoRoute`, `PeerUnreachable`, `MalformedResponse`)
/// are absorbed at the boundary they occur in and converted to JSON
/// error payloads; only `BadRequest` and `Handler` escape to the
/// transport, as 400 and 500 respectively.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// No peer matches the requested service or capability.
    #[error("no route for '{target}', known services: {available:?}")]
    NoRoute {
        target: String,
        available: Vec<String>,
    },

    /// Connect refused or timed out while contacting a peer. Never
    /// fatal; the peer stays in the table until the staleness sweep.
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: NodeId, reason: String },

    /// A peer answered with non-JSON or a non-success status.
    #[error("malformed response from {peer}: {reason}")]
    MalformedResponse { peer: NodeId, reason: String },

    /// The request body failed to parse against the endpoint's schema.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unexpected failure inside a local handler.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl MeshError {
    pub fn bad_request(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }

    /// Routed failures become caller-facing payloads instead of
    /// propagating; see the transport for the status mapping.
    pub fn is_routed(&self) -> bool {
        matches!(
            self,
            Self::NoRoute { .. } | Self::PeerUnreachable { .. } | Self::MalformedResponse { .. }
        )
    }
}
