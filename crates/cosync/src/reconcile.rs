//! Server-side reconciliation for clients that fell behind.
//!
//! A client that missed live broadcasts posts its pending operations and
//! last-known version; the reconciler replays everything recorded since
//! that version against them, persists the survivors and hands back both
//! lists so the client can catch up. The exchange is stateless: all state
//! lives in the operation store.

use crate::error::SyncResult;
use crate::operation::Operation;
use crate::resource::{ResourceKind, ResourceRef};
use crate::store::OperationStore;
use crate::transform::TransformEngine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One reconciliation request.
///
/// All fields are required on the wire; a missing field or an unknown
/// `resource_type` is a malformed request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub resource_type: ResourceKind,
    pub resource_id: String,
    /// Pending local operations, oldest first.
    pub operations: Vec<Operation>,
    /// Highest operation timestamp the client has already seen.
    pub base_version: i64,
}

impl SyncRequest {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::new(self.resource_type, self.resource_id.clone())
    }
}

/// The reconciler's answer: what survived, what was missed, where the
/// client now stands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Pending operations that survived the transform; apply locally.
    pub transformed_operations: Vec<Operation>,
    /// Server operations recorded since `base_version`; apply these too.
    pub server_operations: Vec<Operation>,
    /// Highest server operation timestamp seen, or the request's
    /// `base_version` when nothing new was recorded.
    pub current_version: i64,
}

/// Stateless reconciliation over a shared operation store.
pub struct Reconciler {
    store: Arc<dyn OperationStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self { store }
    }

    /// Run one reconciliation round on behalf of `user_id`.
    ///
    /// Each pending operation is folded through the transform against
    /// every recorded operation since `base_version` that was authored by
    /// someone else; the caller's own recorded operations are already part
    /// of its history and are skipped. Survivors are appended to the store
    /// so later reconciliations see them.
    pub fn reconcile(&self, user_id: &str, request: &SyncRequest) -> SyncResult<SyncResponse> {
        let resource = request.resource();
        let server_operations = self
            .store
            .operations_since(&resource, request.base_version)?;

        let mut engine = TransformEngine::new();
        let mut transformed_operations = Vec::new();
        for pending in &request.operations {
            let survivor = engine.transform_against_all(
                pending,
                server_operations.iter().filter(|op| op.user_id != user_id),
            );
            match survivor {
                Some(op) => transformed_operations.push(op),
                None => tracing::debug!(
                    path = %pending.path,
                    user = %user_id,
                    "pending operation superseded during reconciliation"
                ),
            }
        }

        for op in &transformed_operations {
            self.store.append(&resource, op.clone())?;
        }

        let current_version = server_operations
            .iter()
            .map(|op| op.timestamp)
            .max()
            .unwrap_or(request.base_version);

        tracing::debug!(
            resource = %resource,
            user = %user_id,
            missed = server_operations.len(),
            survived = transformed_operations.len(),
            current_version,
            "reconciliation complete"
        );

        Ok(SyncResponse {
            transformed_operations,
            server_operations,
            current_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::operation::OperationDraft;
    use crate::store::MemoryOperationStore;
    use serde_json::json;

    fn update(user: &str, seq: u64, timestamp: i64, path: &str, value: serde_json::Value) -> Operation {
        let mut clock = VectorClock::new();
        clock.set(user, seq);
        OperationDraft::update(path, value).into_operation(user, clock, timestamp)
    }

    fn request(ops: Vec<Operation>, base_version: i64) -> SyncRequest {
        SyncRequest {
            resource_type: ResourceKind::Workflow,
            resource_id: "wf-1".to_string(),
            operations: ops,
            base_version,
        }
    }

    fn seeded_store(ops: Vec<Operation>) -> Arc<MemoryOperationStore> {
        let store = Arc::new(MemoryOperationStore::new());
        let resource = ResourceRef::workflow("wf-1");
        for op in ops {
            store.append(&resource, op).unwrap();
        }
        store
    }

    #[test]
    fn test_fresh_client_receives_full_history() {
        let store = seeded_store(vec![
            update("bob", 1, 100, "title", json!("a")),
            update("bob", 2, 200, "title", json!("b")),
            update("bob", 3, 300, "title", json!("c")),
        ]);
        let reconciler = Reconciler::new(store);

        let response = reconciler.reconcile("alice", &request(vec![], 0)).unwrap();
        assert_eq!(response.server_operations.len(), 3);
        assert_eq!(response.current_version, 300);
        assert!(response.transformed_operations.is_empty());
    }

    #[test]
    fn test_version_unchanged_when_nothing_recorded() {
        let reconciler = Reconciler::new(Arc::new(MemoryOperationStore::new()));
        let pending = update("alice", 1, 500, "title", json!("mine"));

        let response = reconciler
            .reconcile("alice", &request(vec![pending.clone()], 42))
            .unwrap();
        assert_eq!(response.current_version, 42);
        assert!(response.server_operations.is_empty());
        assert_eq!(response.transformed_operations, vec![pending]);
    }

    #[test]
    fn test_base_version_filter_is_strict() {
        let store = seeded_store(vec![
            update("bob", 1, 100, "a", json!(1)),
            update("bob", 2, 200, "b", json!(2)),
        ]);
        let reconciler = Reconciler::new(store);

        let response = reconciler.reconcile("alice", &request(vec![], 100)).unwrap();
        assert_eq!(response.server_operations.len(), 1);
        assert_eq!(response.server_operations[0].timestamp, 200);
        assert_eq!(response.current_version, 200);
    }

    #[test]
    fn test_heavier_server_update_supersedes_pending() {
        let mut heavy_clock = VectorClock::new();
        heavy_clock.set("bob", 2);
        let server = OperationDraft::update("title", json!("bob wins"))
            .into_operation("bob", heavy_clock, 1_000);
        let store = seeded_store(vec![server]);
        let reconciler = Reconciler::new(store.clone());

        let pending = update("alice", 1, 1_000, "title", json!("alice loses"));
        let response = reconciler
            .reconcile("alice", &request(vec![pending], 0))
            .unwrap();

        assert!(response.transformed_operations.is_empty());
        assert_eq!(response.server_operations.len(), 1);

        // the dropped operation was never persisted
        let resource = ResourceRef::workflow("wf-1");
        assert_eq!(store.operations_since(&resource, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_lighter_server_update_leaves_pending_intact() {
        let server = update("bob", 1, 1_000, "title", json!("bob"));
        let store = seeded_store(vec![server]);
        let reconciler = Reconciler::new(store.clone());

        let mut heavy_clock = VectorClock::new();
        heavy_clock.set("alice", 2);
        let pending = OperationDraft::update("title", json!("alice"))
            .into_operation("alice", heavy_clock, 1_000);

        let response = reconciler
            .reconcile("alice", &request(vec![pending.clone()], 0))
            .unwrap();
        assert_eq!(response.transformed_operations, vec![pending]);

        // survivor persisted alongside the original server op
        let resource = ResourceRef::workflow("wf-1");
        assert_eq!(store.operations_since(&resource, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_callers_own_recorded_operations_are_skipped() {
        // a heavier recorded op by the caller must not supersede the
        // caller's pending op
        let mut heavy_clock = VectorClock::new();
        heavy_clock.set("alice", 5);
        let own_recorded = OperationDraft::update("title", json!("earlier"))
            .into_operation("alice", heavy_clock, 1_000);
        let store = seeded_store(vec![own_recorded]);
        let reconciler = Reconciler::new(store);

        let pending = update("alice", 6, 1_000, "title", json!("latest"));
        let response = reconciler
            .reconcile("alice", &request(vec![pending.clone()], 0))
            .unwrap();
        assert_eq!(response.transformed_operations, vec![pending]);
    }

    #[test]
    fn test_disjoint_pending_survives_conflicting_history() {
        let store = seeded_store(vec![update("bob", 3, 1_000, "nodes.0", json!("x"))]);
        let reconciler = Reconciler::new(store);

        let pending = update("alice", 1, 1_000, "edges.0", json!("y"));
        let response = reconciler
            .reconcile("alice", &request(vec![pending.clone()], 0))
            .unwrap();
        assert_eq!(response.transformed_operations, vec![pending]);
    }

    #[test]
    fn test_survivors_visible_to_later_reconciliations() {
        let store = seeded_store(vec![]);
        let reconciler = Reconciler::new(store.clone());

        let pending = update("alice", 1, 500, "title", json!("from alice"));
        reconciler
            .reconcile("alice", &request(vec![pending], 0))
            .unwrap();

        let response = reconciler.reconcile("bob", &request(vec![], 0)).unwrap();
        assert_eq!(response.server_operations.len(), 1);
        assert_eq!(response.server_operations[0].user_id, "alice");
        assert_eq!(response.current_version, 500);
    }

    #[test]
    fn test_request_wire_shape() {
        let raw = json!({
            "resource_type": "workflow",
            "resource_id": "wf-9",
            "operations": [],
            "base_version": 120
        });
        let request: SyncRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.resource_type, ResourceKind::Workflow);
        assert_eq!(request.resource().channel_name(), "workflow:wf-9");

        let missing = json!({ "resource_id": "wf-9" });
        assert!(serde_json::from_value::<SyncRequest>(missing).is_err());

        let bad_kind = json!({
            "resource_type": "document",
            "resource_id": "wf-9",
            "operations": [],
            "base_version": 0
        });
        assert!(serde_json::from_value::<SyncRequest>(bad_kind).is_err());
    }
}
