//! Client-side collaboration session.
//!
//! A session owns a live projection of one shared resource. It stamps and
//! broadcasts local edits, folds remote edits through the conflict
//! transform against its own unacknowledged operations, and appends every
//! broadcast to a durable operation log independently of pub/sub delivery.
//! Connection lifecycle is explicit: `connect`, `disconnect` and
//! `reconnect` are all idempotent, and nothing fires after teardown.

use crate::clock::VectorClock;
use crate::error::{SyncError, SyncResult};
use crate::operation::{OpKind, Operation, OperationDraft, OperationLog};
use crate::path::Path;
use crate::reconcile::{Reconciler, SyncRequest};
use crate::reducer;
use crate::resource::ResourceRef;
use crate::store::{OperationStore, StoreError};
use crate::transform::{transform, TransformEngine, TransformOutcome};
use crate::transport::{Channel, Subscription, SubscriptionId, Transport, EVENT_OPERATION};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Connection lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not subscribed to the resource channel.
    Disconnected,
    /// Subscribe in progress.
    Connecting,
    /// Live, receiving broadcasts.
    Connected,
    /// Subscribe failed; an explicit `reconnect` is required.
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// The client-local projection of a shared resource.
///
/// `version` is the highest operation timestamp folded in so far and is
/// what a reconciliation request reports as `base_version`. The durable
/// canonical copy lives outside this crate; this is a view, not a record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationState {
    /// The shared JSON tree.
    pub data: Value,
    /// Highest applied operation timestamp (ms since epoch).
    pub version: i64,
    /// Actor behind the most recent change.
    pub last_modified_by: Option<String>,
    /// Timestamp of the most recent change.
    pub last_modified_at: Option<i64>,
}

impl Default for CollaborationState {
    fn default() -> Self {
        Self {
            data: Value::Null,
            version: 0,
            last_modified_by: None,
            last_modified_at: None,
        }
    }
}

impl CollaborationState {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    fn record(&mut self, op: &Operation, data: Value) {
        self.data = data;
        self.version = self.version.max(op.timestamp);
        self.last_modified_by = Some(op.user_id.clone());
        self.last_modified_at = Some(op.timestamp);
    }
}

/// Session tuning.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// When true, local edits are applied optimistically and remote edits
    /// are transformed against unacknowledged local ones. When false the
    /// session is a plain relay: remote edits apply as-is and local edits
    /// only broadcast.
    pub ot_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ot_enabled: true }
    }
}

impl SessionConfig {
    pub fn with_ot_enabled(mut self, enabled: bool) -> Self {
        self.ot_enabled = enabled;
        self
    }
}

/// Everything needed to resume a session later: projection, causal
/// position and unacknowledged operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub resource: ResourceRef,
    pub user_id: String,
    pub state: CollaborationState,
    pub clock: VectorClock,
    pub pending: Vec<Operation>,
}

/// Outcome of one reconciliation round run through [`CollabSession::sync`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncReport {
    /// Missed server operations newly folded into local state.
    pub applied_remote: usize,
    /// Pending operations the server accepted and persisted.
    pub accepted_local: usize,
    /// Pending operations superseded during reconciliation.
    pub dropped_local: usize,
    /// The session's version after the round.
    pub current_version: i64,
}

type ChangeListener = Box<dyn Fn(&CollaborationState, &Operation) + Send + Sync>;

/// A live collaborative editing session for one user on one resource.
pub struct CollabSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    user_id: String,
    resource: ResourceRef,
    config: SessionConfig,
    channel: Arc<dyn Channel>,
    store: Arc<dyn OperationStore>,
    state: Mutex<CollaborationState>,
    clock: Mutex<VectorClock>,
    pending: Mutex<Vec<Operation>>,
    seen: Mutex<OperationLog>,
    connection: Mutex<ConnectionState>,
    listeners: Mutex<Vec<ChangeListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl CollabSession {
    /// Create a session for `user_id` on `resource`. The session starts
    /// disconnected with an empty state tree.
    pub fn new(
        user_id: impl Into<String>,
        resource: ResourceRef,
        config: SessionConfig,
        store: Arc<dyn OperationStore>,
        transport: &dyn Transport,
    ) -> Self {
        let channel = transport.channel(&resource.channel_name());
        Self {
            inner: Arc::new(SessionInner {
                user_id: user_id.into(),
                resource,
                config,
                channel,
                store,
                state: Mutex::new(CollaborationState::default()),
                clock: Mutex::new(VectorClock::new()),
                pending: Mutex::new(Vec::new()),
                seen: Mutex::new(OperationLog::new()),
                connection: Mutex::new(ConnectionState::Disconnected),
                listeners: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Register a callback invoked with the new state and the applied
    /// operation whenever a remote change lands. Never fired for the
    /// session's own operations.
    pub fn on_remote_change(
        &self,
        listener: impl Fn(&CollaborationState, &Operation) + Send + Sync + 'static,
    ) {
        self.inner.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Subscribe to the resource channel and start receiving broadcasts.
    /// Idempotent while connected; a failed subscribe leaves the session
    /// in the error state until `reconnect`.
    pub fn connect(&self) -> SyncResult<()> {
        {
            let mut connection = self.inner.connection.lock().unwrap();
            if *connection == ConnectionState::Connected {
                return Ok(());
            }
            *connection = ConnectionState::Connecting;
        }

        let Subscription { id, mut receiver } = match self.inner.channel.subscribe() {
            Ok(subscription) => subscription,
            Err(err) => {
                *self.inner.connection.lock().unwrap() = ConnectionState::Error;
                return Err(err);
            }
        };
        *self.inner.subscription.lock().unwrap() = Some(id);

        let inner = Arc::clone(&self.inner);
        let listener = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if message.event != EVENT_OPERATION {
                    continue;
                }
                match serde_json::from_value::<Operation>(message.payload) {
                    Ok(op) => {
                        inner.handle_remote(&op);
                    }
                    Err(err) => {
                        tracing::warn!("Ignoring malformed operation payload: {}", err);
                    }
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(listener);

        *self.inner.connection.lock().unwrap() = ConnectionState::Connected;
        tracing::debug!(
            resource = %self.inner.resource,
            user = %self.inner.user_id,
            "session connected"
        );
        Ok(())
    }

    /// Tear down the subscription and listener task. Idempotent, safe to
    /// call on a session that never connected. Unacknowledged operations
    /// are kept for a later [`CollabSession::sync`].
    pub fn disconnect(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(id) = self.inner.subscription.lock().unwrap().take() {
            self.inner.channel.unsubscribe(id);
        }
        let mut connection = self.inner.connection.lock().unwrap();
        if *connection != ConnectionState::Disconnected {
            *connection = ConnectionState::Disconnected;
            tracing::debug!(resource = %self.inner.resource, "session disconnected");
        }
    }

    /// Explicit teardown-then-connect.
    pub fn reconnect(&self) -> SyncResult<()> {
        self.disconnect();
        self.connect()
    }

    /// Stamp a draft with this actor, the current time and an incremented
    /// vector clock, apply it optimistically (when conflict resolution is
    /// enabled), then broadcast it and append it to the durable log.
    ///
    /// Returns the stamped operation, or `None` (with a warning) when the
    /// session is not connected. Move drafts are refused regardless of the
    /// conflict resolution setting; nothing is stamped, queued or logged
    /// for them. Broadcast and log failures are logged rather than raised;
    /// the optimistic apply has already happened and the next
    /// reconciliation closes any gap.
    pub fn broadcast_change(&self, draft: OperationDraft) -> SyncResult<Option<Operation>> {
        if !self.is_connected() {
            tracing::warn!(
                resource = %self.inner.resource,
                "broadcast skipped: session not connected"
            );
            return Ok(None);
        }
        if draft.kind == OpKind::Move {
            return Err(SyncError::UnsupportedOperation(
                "move cannot be broadcast".to_string(),
            ));
        }

        let op = {
            let mut clock = self.inner.clock.lock().unwrap();
            let mut next = clock.clone();
            next.increment(self.inner.user_id.as_str());
            let op = draft.into_operation(
                self.inner.user_id.as_str(),
                next.clone(),
                Utc::now().timestamp_millis(),
            );
            if self.inner.config.ot_enabled {
                let mut state = self.inner.state.lock().unwrap();
                let data = reducer::apply(&state.data, &op)?;
                state.record(&op, data);
            }
            *clock = next;
            op
        };

        self.inner.pending.lock().unwrap().push(op.clone());

        if let Err(err) = self.inner.store.append(&self.inner.resource, op.clone()) {
            tracing::warn!("operation not recorded to durable log: {}", err);
        }
        match serde_json::to_value(&op) {
            Ok(payload) => {
                if let Err(err) = self.inner.channel.publish(EVENT_OPERATION, payload) {
                    tracing::warn!("operation broadcast failed: {}", err);
                }
            }
            Err(err) => tracing::warn!("operation not serialized: {}", err),
        }

        Ok(Some(op))
    }

    /// Apply a local mutation without broadcasting it, for initialization
    /// and non-collaborative contexts. Leaves the vector clock and the
    /// pending queue untouched.
    pub fn apply_local_change(&self, path: impl Into<Path>, value: Value) -> SyncResult<()> {
        let clock = self.inner.clock.lock().unwrap().clone();
        let op = OperationDraft::update(path, value).into_operation(
            self.inner.user_id.as_str(),
            clock,
            Utc::now().timestamp_millis(),
        );
        let mut state = self.inner.state.lock().unwrap();
        let data = reducer::apply(&state.data, &op)?;
        state.record(&op, data);
        Ok(())
    }

    /// Run one reconciliation round: send the pending operations and the
    /// current version, fold the missed server operations into local
    /// state, and clear the pending queue (the survivors are persisted
    /// server-side and acknowledged by the round itself).
    pub fn sync(&self, reconciler: &Reconciler) -> SyncResult<SyncReport> {
        let request = SyncRequest {
            resource_type: self.inner.resource.kind,
            resource_id: self.inner.resource.id.clone(),
            operations: self.inner.pending.lock().unwrap().clone(),
            base_version: self.inner.state.lock().unwrap().version,
        };
        let sent = request.operations.len();

        let response = reconciler.reconcile(&self.inner.user_id, &request)?;

        let mut applied_remote = 0;
        for op in &response.server_operations {
            if op.user_id == self.inner.user_id {
                continue;
            }
            if self.inner.handle_remote(op) {
                applied_remote += 1;
            }
        }

        self.inner.pending.lock().unwrap().clear();
        let current_version = {
            let mut state = self.inner.state.lock().unwrap();
            state.version = state.version.max(response.current_version);
            state.version
        };

        let accepted_local = response.transformed_operations.len();
        Ok(SyncReport {
            applied_remote,
            accepted_local,
            dropped_local: sent - accepted_local,
            current_version,
        })
    }

    // ========== Snapshots ==========

    /// Capture the session's resumable state.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            resource: self.inner.resource.clone(),
            user_id: self.inner.user_id.clone(),
            state: self.inner.state.lock().unwrap().clone(),
            clock: self.inner.clock.lock().unwrap().clone(),
            pending: self.inner.pending.lock().unwrap().clone(),
        }
    }

    /// Adopt a previously captured snapshot. A snapshot taken for a
    /// different resource is ignored with a warning.
    pub fn restore_state(&self, snapshot: SessionSnapshot) {
        if snapshot.resource != self.inner.resource {
            tracing::warn!(
                expected = %self.inner.resource,
                found = %snapshot.resource,
                "snapshot is for a different resource, ignoring"
            );
            return;
        }
        *self.inner.state.lock().unwrap() = snapshot.state;
        *self.inner.clock.lock().unwrap() = snapshot.clock;
        *self.inner.pending.lock().unwrap() = snapshot.pending;
    }

    /// Write the current snapshot to `path` as pretty-printed JSON.
    pub fn save_state(&self, path: impl AsRef<std::path::Path>) -> SyncResult<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json).map_err(StoreError::from)?;
        Ok(())
    }

    /// Restore from a snapshot file written by [`CollabSession::save_state`].
    /// A missing file is not an error.
    pub fn load_state(&self, path: impl AsRef<std::path::Path>) -> SyncResult<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let json = std::fs::read_to_string(path).map_err(StoreError::from)?;
        let snapshot: SessionSnapshot = serde_json::from_str(&json)?;
        self.restore_state(snapshot);
        Ok(())
    }

    // ========== Accessors ==========

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.inner.resource
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Current projection (cloned).
    pub fn state(&self) -> CollaborationState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Current vector clock (cloned).
    pub fn clock(&self) -> VectorClock {
        self.inner.clock.lock().unwrap().clone()
    }

    /// Operations broadcast but not yet acknowledged by a reconciliation.
    pub fn pending_operations(&self) -> Vec<Operation> {
        self.inner.pending.lock().unwrap().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl SessionInner {
    /// Fold one remote operation into local state. Returns true when the
    /// operation changed the projection.
    fn handle_remote(&self, op: &Operation) -> bool {
        if op.user_id == self.user_id {
            return false;
        }
        if !self.seen.lock().unwrap().append(op.clone()) {
            return false;
        }

        self.clock.lock().unwrap().merge(&op.vector_clock);

        let survivor = if self.config.ot_enabled {
            let mut pending = self.pending.lock().unwrap();
            // a pending local op that loses the same-path tie-break is
            // abandoned here; the surviving remote op overwrites its
            // optimistic effect below
            pending.retain(|local| matches!(transform(local, op), TransformOutcome::Unchanged));
            TransformEngine::new().transform_against_all(op, pending.iter())
        } else {
            Some(op.clone())
        };

        let Some(applied) = survivor else {
            tracing::debug!(
                path = %op.path,
                remote = %op.op_ref(),
                "remote operation superseded by a pending local update"
            );
            return false;
        };

        let snapshot = {
            let mut state = self.state.lock().unwrap();
            match reducer::apply(&state.data, &applied) {
                Ok(data) => {
                    state.record(&applied, data);
                    state.clone()
                }
                Err(err) => {
                    tracing::warn!(path = %applied.path, "remote operation not applied: {}", err);
                    return false;
                }
            }
        };

        for listener in self.listeners.lock().unwrap().iter() {
            listener(&snapshot, &applied);
        }
        true
    }
}
