//! Real-time collaborative state synchronization.
//!
//! This crate keeps a JSON state tree consistent across multiple clients
//! editing it at the same time. Every change is a path-addressed
//! [`Operation`] stamped with a [`VectorClock`]; concurrent changes are
//! reconciled with a best-effort last-write-wins transform so that all
//! replicas converge without locking.
//!
//! # Modules
//!
//! - `clock`: Vector clocks for causality tracking and tie-breaking
//! - `operation`: Path-addressed operations and the append-only log
//! - `path`: Dot-delimited paths into the state tree
//! - `reducer`: Pure application of operations to a JSON state tree
//! - `transform`: Conflict detection and last-write-wins transformation
//! - `session`: The client-side collaboration session
//! - `reconcile`: Server-side catch-up for reconnecting clients
//! - `presence`: Who-is-here tracking with heartbeats and staleness
//! - `store`: Operation persistence (in-memory and file-backed)
//! - `transport`: Publish/subscribe channel abstraction
//! - `resource`: Identifiers for the things being collaborated on
//! - `error`: Error types for the crate
//!
//! # Example
//!
//! ```
//! use cosync::clock::VectorClock;
//! use cosync::operation::OperationDraft;
//! use cosync::reducer;
//! use serde_json::json;
//!
//! // Stamp a draft with the emitting actor's clock.
//! let mut clock = VectorClock::new();
//! clock.increment("alice");
//! let op = OperationDraft::update("title", json!("Launch plan"))
//!     .into_operation("alice", clock, 1_700_000_000_000);
//!
//! // Fold it into the shared state tree.
//! let state = reducer::apply(&json!({"title": "Untitled"}), &op).unwrap();
//! assert_eq!(state["title"], json!("Launch plan"));
//! ```

pub mod clock;
pub mod error;
pub mod operation;
pub mod path;
pub mod presence;
pub mod reconcile;
pub mod reducer;
pub mod resource;
pub mod session;
pub mod store;
pub mod transform;
pub mod transport;

/// Collaboration server module.
///
/// This module is only available when the `server` feature is enabled.
/// It provides the HTTP reconciliation/presence API and the WebSocket
/// relay that fans operations out to subscribed clients.
///
/// # Example
///
/// ```ignore
/// use cosync::server::{RelayServer, ServerConfig};
/// use cosync::store::MemoryOperationStore;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let config = ServerConfig::default();
///     let server = RelayServer::new(config, Arc::new(MemoryOperationStore::new()));
///     server.run().await.unwrap();
/// }
/// ```
#[cfg(feature = "server")]
pub mod server;

// Re-export commonly used types
pub use clock::VectorClock;
pub use error::{SyncError, SyncResult};
pub use operation::{OpKind, OpRef, Operation, OperationDraft, OperationLog};
pub use path::Path;
pub use presence::{
    assign_color, default_palette, MemoryPresenceStore, PresenceConfig, PresenceRecord,
    PresenceStatus, PresenceStore, PresenceTracker, UserIdentity,
};
pub use reconcile::{Reconciler, SyncRequest, SyncResponse};
pub use resource::{ResourceKind, ResourceRef};
pub use session::{
    CollabSession, CollaborationState, ConnectionState, SessionConfig, SessionSnapshot, SyncReport,
};
pub use store::{FileOperationStore, MemoryOperationStore, OperationStore, StoreError, StoreResult};
pub use transform::{transform, ConflictRecord, TransformEngine, TransformOutcome};
pub use transport::{
    Channel, ChannelMessage, InMemoryHub, Subscription, SubscriptionId, Transport,
    EVENT_OPERATION, EVENT_PRESENCE,
};
