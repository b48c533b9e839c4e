//! Weft Mesh Protocol
//!
//! Every container in a weft deployment runs an identical mesh node.
//! Nodes discover each other by announcing to well-known local ports and
//! route work to whichever peer advertises the right service or capability,
//! with no central broker.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────┐  announce  ┌────────┐  announce  ┌────────┐
//!  │ python │◄──────────►│   go   │◄──────────►│ nodejs │
//!  │ :5000  │            │ :8082  │            │ :3000  │
//!  └────────┘            └────────┘            └────────┘
//!      ▲                                           ▲
//!      └────────────── request forwarding ─────────┘
//! ```
//!
//! ## Discovery
//! - Each node keeps a peer table plus a service-name index
//! - Every 30s it announces itself to the well-known port list
//! - Announce replies carry the responder's full peer list, which is
//!   merged back (last-write-wins per node id)
//! - Peers not seen for 2 minutes are swept out
//!
//! ## Routing
//! - A request names a target service or capability
//! - Matching nodes handle it locally; otherwise it is forwarded verbatim
//!   to the first matching peer and the reply is relayed as-is
//!
//! ## Stores
//! - Conversation history per session, bounded and idle-swept
//! - A TTL response cache with insertion-order eviction

pub mod ai;
pub mod cache;
pub mod discovery;
pub mod error;
pub mod history;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod router;
pub mod types;

pub use error::MeshError;
pub use node::MeshNode;
pub use peer::{PeerRecord, PeerRegistry};
pub use types::MeshConfig;
