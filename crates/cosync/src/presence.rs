//! Presence tracking for collaborative resources.
//!
//! Each participant periodically heartbeats a presence record onto the
//! resource's presence channel and into a presence store, and polls the
//! store roster on the same interval. Activity is derived from heartbeat
//! recency at read time, so a stale record is reported as inactive rather
//! than silently dropped from the roster.

use crate::error::SyncResult;
use crate::resource::ResourceRef;
use crate::transport::{Channel, Subscription, SubscriptionId, Transport, EVENT_PRESENCE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Who a participant is, as shown to other collaborators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Stable user ID.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
    /// Optional email.
    pub user_email: Option<String>,
    /// Optional role label (owner, collaborator, viewer).
    pub role: Option<String>,
}

impl UserIdentity {
    /// Create a new identity with only an ID and display name.
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_email: None,
            role: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.user_email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Self-reported availability, driven by tab visibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Away,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Active => "active",
            PresenceStatus::Away => "away",
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collaborator's presence row as carried on the wire.
///
/// Application-specific fields (cursor position, status, color) live in the
/// open `presence_data` bag rather than as typed columns, since their shape
/// belongs to the embedding application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// User ID.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
    /// Optional email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    /// Optional role label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Open bag of custom fields (cursor position, status, color).
    #[serde(default)]
    pub presence_data: Map<String, Value>,
    /// Last heartbeat timestamp (ms since epoch).
    pub last_heartbeat: i64,
    /// Whether the heartbeat is recent enough to count as present.
    pub is_active: bool,
}

impl PresenceRecord {
    /// Create a fresh record for an identity, active as of now.
    pub fn new(identity: &UserIdentity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
            user_email: identity.user_email.clone(),
            role: identity.role.clone(),
            presence_data: Map::new(),
            last_heartbeat: now_ms(),
            is_active: true,
        }
    }

    /// Set a custom presence field.
    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        self.presence_data.insert(key.into(), value);
    }

    /// Builder-style variant of [`PresenceRecord::set_field`].
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set_field(key, value);
        self
    }

    /// Read a custom presence field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.presence_data.get(key)
    }

    /// Status parsed from `presence_data`, defaulting to active.
    pub fn status(&self) -> PresenceStatus {
        match self.presence_data.get("status").and_then(Value::as_str) {
            Some("away") => PresenceStatus::Away,
            _ => PresenceStatus::Active,
        }
    }

    /// Display color from `presence_data`, when assigned.
    pub fn color(&self) -> Option<&str> {
        self.presence_data.get("color").and_then(Value::as_str)
    }

    /// Refresh the heartbeat timestamp.
    pub fn touch(&mut self) {
        self.last_heartbeat = now_ms();
        self.is_active = true;
    }

    /// Whether the heartbeat at `now_ms` is within `threshold_ms`.
    pub fn is_active_at(&self, now_ms: i64, threshold_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat) < threshold_ms
    }

    /// Copy of this record with `is_active` recomputed from recency.
    pub fn refreshed(&self, now_ms: i64, threshold_ms: i64) -> Self {
        let mut record = self.clone();
        record.is_active = record.is_active_at(now_ms, threshold_ms);
        record
    }
}

/// Tuning knobs for presence tracking.
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// How often a heartbeat is emitted and the roster re-polled.
    pub heartbeat_interval: Duration,
    /// How old a heartbeat may be before the user is reported inactive.
    pub active_threshold: Duration,
    /// Colors available for collaborator assignment.
    pub palette: Vec<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            active_threshold: Duration::from_secs(120),
            palette: default_palette(),
        }
    }
}

impl PresenceConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_active_threshold(mut self, threshold: Duration) -> Self {
        self.active_threshold = threshold;
        self
    }

    pub fn with_palette(mut self, palette: Vec<String>) -> Self {
        self.palette = palette;
        self
    }

    fn active_threshold_ms(&self) -> i64 {
        self.active_threshold.as_millis() as i64
    }
}

/// Default color palette for collaborators.
pub fn default_palette() -> Vec<String> {
    vec![
        "#E91E63".into(), // Pink
        "#9C27B0".into(), // Purple
        "#3F51B5".into(), // Indigo
        "#2196F3".into(), // Blue
        "#00BCD4".into(), // Cyan
        "#4CAF50".into(), // Green
        "#FF9800".into(), // Orange
        "#795548".into(), // Brown
    ]
}

/// Assign a color based on user ID (deterministic).
///
/// Hash-based rather than round-robin so every process derives the same
/// color for a user without coordination.
pub fn assign_color(user_id: &str, palette: &[String]) -> String {
    if palette.is_empty() {
        return String::new();
    }
    let hash: usize = user_id.bytes().map(|b| b as usize).sum();
    palette[hash % palette.len()].clone()
}

/// Server-side presence rows, one per (resource, user).
pub trait PresenceStore: Send + Sync {
    /// Upsert a heartbeat row for a resource.
    fn update_presence_heartbeat(
        &self,
        resource: &ResourceRef,
        record: PresenceRecord,
    ) -> SyncResult<()>;

    /// Every known collaborator for a resource, ordered by user ID, with
    /// `is_active` recomputed from heartbeat recency. Stale rows are
    /// flagged inactive, not removed.
    fn get_active_collaborators(&self, resource: &ResourceRef) -> SyncResult<Vec<PresenceRecord>>;

    /// Drop a collaborator's row, typically on clean departure.
    fn remove_presence(&self, resource: &ResourceRef, user_id: &str) -> SyncResult<()>;
}

/// In-memory presence rows keyed by presence channel name.
pub struct MemoryPresenceStore {
    rows: Mutex<HashMap<String, HashMap<String, PresenceRecord>>>,
    active_threshold_ms: i64,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            active_threshold_ms: PresenceConfig::default().active_threshold_ms(),
        }
    }

    pub fn with_active_threshold(threshold: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            active_threshold_ms: threshold.as_millis() as i64,
        }
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn update_presence_heartbeat(
        &self,
        resource: &ResourceRef,
        record: PresenceRecord,
    ) -> SyncResult<()> {
        let mut rows = self.rows.lock().unwrap();
        rows.entry(resource.presence_channel_name())
            .or_default()
            .insert(record.user_id.clone(), record);
        Ok(())
    }

    fn get_active_collaborators(&self, resource: &ResourceRef) -> SyncResult<Vec<PresenceRecord>> {
        let now = now_ms();
        let rows = self.rows.lock().unwrap();
        let mut records: Vec<PresenceRecord> = rows
            .get(&resource.presence_channel_name())
            .map(|users| {
                users
                    .values()
                    .map(|record| record.refreshed(now, self.active_threshold_ms))
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(records)
    }

    fn remove_presence(&self, resource: &ResourceRef, user_id: &str) -> SyncResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(users) = rows.get_mut(&resource.presence_channel_name()) {
            users.remove(user_id);
            if users.is_empty() {
                rows.remove(&resource.presence_channel_name());
            }
        }
        Ok(())
    }
}

type RosterListener = Box<dyn Fn(&[PresenceRecord]) + Send + Sync>;
type JoinedListener = Box<dyn Fn(&PresenceRecord) + Send + Sync>;
type LeftListener = Box<dyn Fn(&str) + Send + Sync>;

/// Tracks one participant's presence on one resource.
///
/// `start` emits an immediate heartbeat and roster fetch, then repeats
/// both on the heartbeat interval while also folding pushed heartbeats
/// into the roster as they arrive. Membership changes in the *active* set
/// fire joined/left callbacks. `stop` (also run on drop) aborts the
/// background tasks, unsubscribes from the presence channel and removes
/// the participant's store row, after which nothing fires again.
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    identity: UserIdentity,
    resource: ResourceRef,
    config: PresenceConfig,
    color: String,
    store: Arc<dyn PresenceStore>,
    channel: Arc<dyn Channel>,
    status: Mutex<PresenceStatus>,
    roster: Mutex<HashMap<String, PresenceRecord>>,
    previous_active: Mutex<HashSet<String>>,
    change_listeners: Mutex<Vec<RosterListener>>,
    joined_listeners: Mutex<Vec<JoinedListener>>,
    left_listeners: Mutex<Vec<LeftListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    running: AtomicBool,
}

impl PresenceTracker {
    /// Create a tracker for `identity` on `resource`. No tasks run until
    /// [`PresenceTracker::start`].
    pub fn new(
        identity: UserIdentity,
        resource: ResourceRef,
        config: PresenceConfig,
        store: Arc<dyn PresenceStore>,
        transport: &dyn Transport,
    ) -> Self {
        let channel = transport.channel(&resource.presence_channel_name());
        let color = assign_color(&identity.user_id, &config.palette);
        Self {
            inner: Arc::new(TrackerInner {
                identity,
                resource,
                config,
                color,
                store,
                channel,
                status: Mutex::new(PresenceStatus::Active),
                roster: Mutex::new(HashMap::new()),
                previous_active: Mutex::new(HashSet::new()),
                change_listeners: Mutex::new(Vec::new()),
                joined_listeners: Mutex::new(Vec::new()),
                left_listeners: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                subscription: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Register a callback invoked with the roster (self excluded, sorted
    /// by user ID) whenever a heartbeat or roster poll changes it.
    pub fn on_presence_change(&self, listener: impl Fn(&[PresenceRecord]) + Send + Sync + 'static) {
        self.inner
            .change_listeners
            .lock()
            .unwrap()
            .push(Box::new(listener));
    }

    /// Register a callback fired when a collaborator becomes active.
    pub fn on_user_joined(&self, listener: impl Fn(&PresenceRecord) + Send + Sync + 'static) {
        self.inner
            .joined_listeners
            .lock()
            .unwrap()
            .push(Box::new(listener));
    }

    /// Register a callback fired with the user ID of a collaborator that
    /// stopped being active (aged out or cleanly departed).
    pub fn on_user_left(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.inner
            .left_listeners
            .lock()
            .unwrap()
            .push(Box::new(listener));
    }

    /// Begin heartbeating and listening for remote presence. Idempotent.
    pub fn start(&self) -> SyncResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.beat();
        self.inner.refresh_from_store();

        let Subscription { id, mut receiver } = match self.inner.channel.subscribe() {
            Ok(subscription) => subscription,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        *self.inner.subscription.lock().unwrap() = Some(id);

        let inner = Arc::clone(&self.inner);
        let listener = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if message.event != EVENT_PRESENCE {
                    continue;
                }
                match serde_json::from_value::<PresenceRecord>(message.payload) {
                    Ok(record) => inner.handle_remote(record),
                    Err(err) => {
                        tracing::warn!("Ignoring malformed presence payload: {}", err);
                    }
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        let period = self.inner.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                inner.beat();
                inner.refresh_from_store();
            }
        });

        self.inner
            .tasks
            .lock()
            .unwrap()
            .extend([listener, heartbeat]);
        Ok(())
    }

    /// Report whether the tab is visible; hidden tabs heartbeat as away.
    /// On a stopped tracker this only records the status for the next
    /// start, without writing or publishing anything.
    pub fn set_visibility(&self, visible: bool) {
        let status = if visible {
            PresenceStatus::Active
        } else {
            PresenceStatus::Away
        };
        *self.inner.status.lock().unwrap() = status;
        if self.is_running() {
            self.inner.beat();
        }
    }

    /// Stop heartbeating and listening. Idempotent; safe to call twice.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(id) = self.inner.subscription.lock().unwrap().take() {
            self.inner.channel.unsubscribe(id);
        }
        if let Err(err) = self
            .inner
            .store
            .remove_presence(&self.inner.resource, &self.inner.identity.user_id)
        {
            tracing::debug!("Presence row not removed on stop: {}", err);
        }
    }

    /// Roster of remote collaborators, sorted by user ID, with activity
    /// recomputed from heartbeat recency.
    pub fn collaborators(&self) -> Vec<PresenceRecord> {
        self.inner.collaborators()
    }

    /// The color assigned to this participant.
    pub fn color(&self) -> &str {
        &self.inner.color
    }

    /// The participant's user ID.
    pub fn user_id(&self) -> &str {
        &self.inner.identity.user_id
    }

    /// The tracked resource.
    pub fn resource(&self) -> &ResourceRef {
        &self.inner.resource
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TrackerInner {
    fn local_record(&self) -> PresenceRecord {
        let status = *self.status.lock().unwrap();
        PresenceRecord::new(&self.identity)
            .with_field("status", json!(status.as_str()))
            .with_field("color", json!(self.color))
    }

    /// Store and publish one heartbeat. Failures are logged, not raised:
    /// a missed heartbeat only delays the activity signal and the next
    /// tick retries on its own.
    fn beat(&self) {
        let record = self.local_record();
        if let Err(err) = self
            .store
            .update_presence_heartbeat(&self.resource, record.clone())
        {
            tracing::warn!("Presence heartbeat not stored: {}", err);
        }
        match serde_json::to_value(&record) {
            Ok(payload) => {
                if let Err(err) = self.channel.publish(EVENT_PRESENCE, payload) {
                    tracing::warn!("Presence heartbeat not published: {}", err);
                }
            }
            Err(err) => tracing::warn!("Presence record not serialized: {}", err),
        }
    }

    /// Reconcile the local roster against the store and re-diff. Rows the
    /// store no longer has are dropped, unless a pushed heartbeat fresher
    /// than the fetch has already replaced them.
    fn refresh_from_store(&self) {
        let fetched_at = now_ms();
        match self.store.get_active_collaborators(&self.resource) {
            Ok(records) => {
                {
                    let mut roster = self.roster.lock().unwrap();
                    let fetched: HashSet<String> =
                        records.iter().map(|record| record.user_id.clone()).collect();
                    roster.retain(|user_id, record| {
                        fetched.contains(user_id) || record.last_heartbeat > fetched_at
                    });
                    for record in records {
                        if record.user_id != self.identity.user_id {
                            roster.insert(record.user_id.clone(), record);
                        }
                    }
                }
                self.diff_and_notify();
            }
            Err(err) => tracing::warn!("Presence roster not fetched: {}", err),
        }
    }

    fn handle_remote(&self, record: PresenceRecord) {
        if record.user_id == self.identity.user_id {
            return;
        }
        self.roster
            .lock()
            .unwrap()
            .insert(record.user_id.clone(), record);
        self.diff_and_notify();
    }

    /// Recompute the active set, fire joined/left for the delta and then
    /// the roster-change listeners.
    fn diff_and_notify(&self) {
        let roster = self.collaborators();
        let active_now: HashSet<String> = roster
            .iter()
            .filter(|record| record.is_active)
            .map(|record| record.user_id.clone())
            .collect();

        let (mut joined, mut left) = {
            let mut previous = self.previous_active.lock().unwrap();
            let joined: Vec<String> = active_now.difference(&previous).cloned().collect();
            let left: Vec<String> = previous.difference(&active_now).cloned().collect();
            *previous = active_now;
            (joined, left)
        };
        joined.sort();
        left.sort();

        for user_id in &joined {
            if let Some(record) = roster.iter().find(|record| &record.user_id == user_id) {
                for listener in self.joined_listeners.lock().unwrap().iter() {
                    listener(record);
                }
            }
        }
        for user_id in &left {
            for listener in self.left_listeners.lock().unwrap().iter() {
                listener(user_id);
            }
        }
        for listener in self.change_listeners.lock().unwrap().iter() {
            listener(&roster);
        }
    }

    fn collaborators(&self) -> Vec<PresenceRecord> {
        let now = now_ms();
        let threshold = self.config.active_threshold_ms();
        let mut records: Vec<PresenceRecord> = self
            .roster
            .lock()
            .unwrap()
            .values()
            .map(|record| record.refreshed(now, threshold))
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }
}

/// Current timestamp in milliseconds since epoch.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryHub;
    use std::sync::atomic::AtomicUsize;

    fn alice() -> UserIdentity {
        UserIdentity::new("alice", "Alice")
    }

    fn bob_record() -> PresenceRecord {
        PresenceRecord::new(&UserIdentity::new("bob", "Bob")).with_field("color", json!("#9C27B0"))
    }

    fn tracker_with(
        hub: &InMemoryHub,
        store: Arc<dyn PresenceStore>,
        config: PresenceConfig,
    ) -> PresenceTracker {
        PresenceTracker::new(alice(), ResourceRef::workflow("wf-1"), config, store, hub)
    }

    // ========== Record Tests ==========

    #[test]
    fn test_new_record_is_active() {
        let record = PresenceRecord::new(&alice());
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.status(), PresenceStatus::Active);
        assert!(record.is_active);
        assert!(record.last_heartbeat > 0);
        assert!(record.presence_data.is_empty());
    }

    #[test]
    fn test_presence_data_fields() {
        let mut record = PresenceRecord::new(&alice());
        record.set_field("status", json!("away"));
        record.set_field("cursor", json!({"x": 10, "y": 4}));

        assert_eq!(record.status(), PresenceStatus::Away);
        assert_eq!(record.field("cursor"), Some(&json!({"x": 10, "y": 4})));
        assert!(record.color().is_none());
    }

    #[test]
    fn test_activity_threshold_is_strict() {
        let mut record = PresenceRecord::new(&alice());
        record.last_heartbeat = 0;

        assert!(record.is_active_at(119_999, 120_000));
        assert!(!record.is_active_at(120_000, 120_000));
        assert!(!record.is_active_at(500_000, 120_000));
    }

    #[test]
    fn test_refreshed_recomputes_activity() {
        let mut record = PresenceRecord::new(&alice());
        record.last_heartbeat = 1_000;

        let stale = record.refreshed(500_000, 120_000);
        assert!(!stale.is_active);
        assert_eq!(stale.user_id, record.user_id);

        let fresh = record.refreshed(2_000, 120_000);
        assert!(fresh.is_active);
    }

    #[test]
    fn test_record_wire_format_is_camel_case() {
        let identity = UserIdentity::new("alice", "Alice").with_email("alice@example.com");
        let mut record = PresenceRecord::new(&identity).with_field("color", json!("#E91E63"));
        record.last_heartbeat = 42;

        let wire = serde_json::to_value(&record).unwrap();
        let object = wire.as_object().unwrap();
        assert!(object.contains_key("userId"));
        assert!(object.contains_key("userName"));
        assert!(object.contains_key("userEmail"));
        assert!(object.contains_key("presenceData"));
        assert!(object.contains_key("lastHeartbeat"));
        assert!(object.contains_key("isActive"));
        assert!(!object.contains_key("role"));
        assert_eq!(wire["presenceData"]["color"], "#E91E63");

        let back: PresenceRecord = serde_json::from_value(wire).unwrap();
        assert_eq!(back, record);
    }

    // ========== Color Tests ==========

    #[test]
    fn test_color_assignment_deterministic() {
        let palette = default_palette();
        let color1 = assign_color("user-123", &palette);
        let color2 = assign_color("user-123", &palette);
        assert_eq!(color1, color2);
        assert!(palette.contains(&color1));
    }

    #[test]
    fn test_color_assignment_wraps_palette() {
        let palette: Vec<String> = vec!["#FF0000".into(), "#00FF00".into()];
        // 'a' + 'b' = 195, odd index
        assert_eq!(assign_color("ab", &palette), "#00FF00");
    }

    #[test]
    fn test_default_palette_shape() {
        let palette = default_palette();
        assert_eq!(palette.len(), 8);
        for color in &palette {
            assert!(color.starts_with('#'));
            assert_eq!(color.len(), 7);
        }
    }

    // ========== Store Tests ==========

    #[test]
    fn test_store_upserts_heartbeats() {
        let store = MemoryPresenceStore::new();
        let resource = ResourceRef::workflow("wf-1");

        store
            .update_presence_heartbeat(&resource, PresenceRecord::new(&alice()))
            .unwrap();
        store
            .update_presence_heartbeat(&resource, bob_record())
            .unwrap();

        let newer = PresenceRecord::new(&alice()).with_field("status", json!("away"));
        store.update_presence_heartbeat(&resource, newer).unwrap();

        let records = store.get_active_collaborators(&resource).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_id, "alice");
        assert_eq!(records[0].status(), PresenceStatus::Away);
        assert_eq!(records[1].user_id, "bob");
    }

    #[test]
    fn test_store_flags_stale_rows_inactive() {
        let store = MemoryPresenceStore::new();
        let resource = ResourceRef::session("s-1");

        let mut stale = bob_record();
        stale.last_heartbeat = 1_000;
        store.update_presence_heartbeat(&resource, stale).unwrap();
        store
            .update_presence_heartbeat(&resource, PresenceRecord::new(&alice()))
            .unwrap();

        let records = store.get_active_collaborators(&resource).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_active);
        assert!(!records[1].is_active);
    }

    #[test]
    fn test_store_remove_presence() {
        let store = MemoryPresenceStore::new();
        let resource = ResourceRef::workflow("wf-1");

        store
            .update_presence_heartbeat(&resource, bob_record())
            .unwrap();
        store.remove_presence(&resource, "bob").unwrap();
        store.remove_presence(&resource, "nobody").unwrap();

        assert!(store.get_active_collaborators(&resource).unwrap().is_empty());
    }

    // ========== Tracker Tests ==========

    #[tokio::test]
    async fn test_start_emits_initial_heartbeat() {
        let hub = InMemoryHub::new();
        let raw = hub.channel("presence:workflow:wf-1");
        let mut sub = raw.subscribe().unwrap();

        let store = Arc::new(MemoryPresenceStore::new());
        let tracker = tracker_with(&hub, store.clone(), PresenceConfig::default());
        tracker.start().unwrap();

        let message = sub.receiver.recv().await.unwrap();
        assert_eq!(message.event, EVENT_PRESENCE);
        let record: PresenceRecord = serde_json::from_value(message.payload).unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.color(), Some(tracker.color()));
        assert_eq!(record.status(), PresenceStatus::Active);

        let rows = store
            .get_active_collaborators(&ResourceRef::workflow("wf-1"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "alice");

        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_repeats_on_interval() {
        let hub = InMemoryHub::new();
        let raw = hub.channel("presence:workflow:wf-1");
        let mut sub = raw.subscribe().unwrap();

        let tracker = tracker_with(
            &hub,
            Arc::new(MemoryPresenceStore::new()),
            PresenceConfig::default(),
        );
        tracker.start().unwrap();

        sub.receiver.recv().await.unwrap();
        // paused clock advances to the next interval tick while we wait
        let second = sub.receiver.recv().await.unwrap();
        assert_eq!(second.event, EVENT_PRESENCE);

        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_heartbeats_update_roster() {
        let hub = InMemoryHub::new();
        let tracker = tracker_with(
            &hub,
            Arc::new(MemoryPresenceStore::new()),
            PresenceConfig::default(),
        );

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        tracker.on_presence_change(move |roster| {
            seen_clone.store(roster.len(), Ordering::SeqCst);
        });
        tracker.start().unwrap();

        let raw = hub.channel("presence:workflow:wf-1");
        raw.publish(EVENT_PRESENCE, serde_json::to_value(bob_record()).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let roster = tracker.collaborators();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, "bob");
        assert!(roster[0].is_active);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_and_left_fire_on_activity_changes() {
        let hub = InMemoryHub::new();
        let tracker = tracker_with(
            &hub,
            Arc::new(MemoryPresenceStore::new()),
            PresenceConfig::default(),
        );

        let joined: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let left: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let joined_clone = Arc::clone(&joined);
        let left_clone = Arc::clone(&left);
        tracker.on_user_joined(move |record| {
            joined_clone.lock().unwrap().push(record.user_id.clone());
        });
        tracker.on_user_left(move |user_id| {
            left_clone.lock().unwrap().push(user_id.to_string());
        });
        tracker.start().unwrap();

        let raw = hub.channel("presence:workflow:wf-1");
        raw.publish(EVENT_PRESENCE, serde_json::to_value(bob_record()).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(joined.lock().unwrap().as_slice(), ["bob"]);
        assert!(left.lock().unwrap().is_empty());

        // a heartbeat far in the past ages bob out of the active set
        let mut stale = bob_record();
        stale.last_heartbeat = 1_000;
        raw.publish(EVENT_PRESENCE, serde_json::to_value(stale).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(left.lock().unwrap().as_slice(), ["bob"]);
        let roster = tracker.collaborators();
        assert_eq!(roster.len(), 1);
        assert!(!roster[0].is_active);

        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_echo_is_ignored() {
        let hub = InMemoryHub::new();
        let tracker = tracker_with(
            &hub,
            Arc::new(MemoryPresenceStore::new()),
            PresenceConfig::default(),
        );
        tracker.start().unwrap();

        let raw = hub.channel("presence:workflow:wf-1");
        let own = PresenceRecord::new(&alice());
        raw.publish(EVENT_PRESENCE, serde_json::to_value(own).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(tracker.collaborators().is_empty());
        tracker.stop();
    }

    #[tokio::test]
    async fn test_roster_seeded_from_store() {
        let hub = InMemoryHub::new();
        let store = Arc::new(MemoryPresenceStore::new());
        store
            .update_presence_heartbeat(&ResourceRef::workflow("wf-1"), bob_record())
            .unwrap();

        let tracker = tracker_with(&hub, store, PresenceConfig::default());
        let joined = Arc::new(Mutex::new(Vec::new()));
        let joined_clone = Arc::clone(&joined);
        tracker.on_user_joined(move |record| {
            joined_clone.lock().unwrap().push(record.user_id.clone());
        });
        tracker.start().unwrap();

        let roster = tracker.collaborators();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, "bob");
        assert_eq!(joined.lock().unwrap().as_slice(), ["bob"]);

        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_prunes_rows_deleted_from_store() {
        let hub = InMemoryHub::new();
        let store = Arc::new(MemoryPresenceStore::new());
        let resource = ResourceRef::workflow("wf-1");
        store
            .update_presence_heartbeat(&resource, bob_record())
            .unwrap();

        let tracker = tracker_with(&hub, store.clone(), PresenceConfig::default());
        let left: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let left_clone = Arc::clone(&left);
        tracker.on_user_left(move |user_id| {
            left_clone.lock().unwrap().push(user_id.to_string());
        });
        tracker.start().unwrap();
        assert_eq!(tracker.collaborators().len(), 1);

        // bob departs cleanly, deleting his store row
        store.remove_presence(&resource, "bob").unwrap();

        // a pushed heartbeat newer than any fetch survives the prune
        let mut carol = PresenceRecord::new(&UserIdentity::new("carol", "Carol"));
        carol.last_heartbeat = now_ms() + 60_000;
        let raw = hub.channel("presence:workflow:wf-1");
        raw.publish(EVENT_PRESENCE, serde_json::to_value(&carol).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // next interval tick re-polls the store
        tokio::time::sleep(Duration::from_secs(31)).await;

        let roster = tracker.collaborators();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, "carol");
        assert_eq!(left.lock().unwrap().as_slice(), ["bob"]);

        tracker.stop();
    }

    #[tokio::test]
    async fn test_visibility_changes_status() {
        let hub = InMemoryHub::new();
        let store = Arc::new(MemoryPresenceStore::new());
        let resource = ResourceRef::workflow("wf-1");
        let tracker = tracker_with(&hub, store.clone(), PresenceConfig::default());
        tracker.start().unwrap();

        tracker.set_visibility(false);
        let rows = store.get_active_collaborators(&resource).unwrap();
        assert_eq!(rows[0].status(), PresenceStatus::Away);

        tracker.set_visibility(true);
        let rows = store.get_active_collaborators(&resource).unwrap();
        assert_eq!(rows[0].status(), PresenceStatus::Active);

        tracker.stop();
    }

    #[tokio::test]
    async fn test_visibility_change_after_stop_stays_silent() {
        let hub = InMemoryHub::new();
        let raw = hub.channel("presence:workflow:wf-1");
        let mut sub = raw.subscribe().unwrap();

        let store = Arc::new(MemoryPresenceStore::new());
        let resource = ResourceRef::workflow("wf-1");
        let tracker = tracker_with(&hub, store.clone(), PresenceConfig::default());
        tracker.start().unwrap();
        sub.receiver.recv().await.unwrap();
        tracker.stop();

        // no row comes back and nothing is published
        tracker.set_visibility(false);
        assert!(sub.receiver.try_recv().is_err());
        assert!(store.get_active_collaborators(&resource).unwrap().is_empty());

        // the recorded status still lands on the next start
        tracker.start().unwrap();
        let message = sub.receiver.recv().await.unwrap();
        let record: PresenceRecord = serde_json::from_value(message.payload).unwrap();
        assert_eq!(record.status(), PresenceStatus::Away);

        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_heartbeats_and_listening() {
        let hub = InMemoryHub::new();
        let raw = hub.channel("presence:workflow:wf-1");
        let mut sub = raw.subscribe().unwrap();

        let store = Arc::new(MemoryPresenceStore::new());
        let tracker = tracker_with(&hub, store.clone(), PresenceConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        tracker.on_presence_change(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        tracker.start().unwrap();
        sub.receiver.recv().await.unwrap();
        let fired_before_stop = fired.load(Ordering::SeqCst);

        tracker.stop();
        assert!(!tracker.is_running());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(sub.receiver.try_recv().is_err());

        raw.publish(EVENT_PRESENCE, serde_json::to_value(bob_record()).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tracker.collaborators().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), fired_before_stop);

        // own row removed on clean stop
        assert!(store
            .get_active_collaborators(&ResourceRef::workflow("wf-1"))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let hub = InMemoryHub::new();
        let tracker = tracker_with(
            &hub,
            Arc::new(MemoryPresenceStore::new()),
            PresenceConfig::default(),
        );
        tracker.start().unwrap();
        tracker.stop();
        tracker.stop();
        assert!(!tracker.is_running());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = InMemoryHub::new();
        {
            let tracker = tracker_with(
                &hub,
                Arc::new(MemoryPresenceStore::new()),
                PresenceConfig::default(),
            );
            tracker.start().unwrap();
            assert_eq!(hub.subscriber_count("presence:workflow:wf-1"), 1);
        }
        assert_eq!(hub.subscriber_count("presence:workflow:wf-1"), 0);
    }
}
