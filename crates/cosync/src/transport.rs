//! Pub/sub transport abstraction for operation and presence broadcast.
//!
//! Sessions never talk to a socket directly: they hold a [`Channel`] looked
//! up from a [`Transport`]. Any transport that can fan messages out to
//! channel subscribers can back a session; [`InMemoryHub`] is the built-in
//! implementation used by tests, by embedded deployments and by the server
//! process itself.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Event name carrying a serialized operation.
pub const EVENT_OPERATION: &str = "operation";
/// Event name carrying a presence record change.
pub const EVENT_PRESENCE: &str = "presence";

/// One message delivered to channel subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

/// Identifies one subscription within a channel.
pub type SubscriptionId = u64;

/// A live subscription: the id to unsubscribe with and the stream of
/// incoming messages.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::UnboundedReceiver<ChannelMessage>,
}

/// A named broadcast channel.
pub trait Channel: Send + Sync {
    /// The channel's name (see `ResourceRef::channel_name`).
    fn name(&self) -> &str;

    /// Deliver an event to every current subscriber of this channel.
    /// Delivery is best-effort; subscribers that went away are skipped.
    fn publish(&self, event: &str, payload: Value) -> SyncResult<()>;

    /// Start receiving messages published on this channel.
    fn subscribe(&self) -> SyncResult<Subscription>;

    /// Stop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Hands out channels by name.
pub trait Transport: Send + Sync {
    fn channel(&self, name: &str) -> Arc<dyn Channel>;
}

#[derive(Default)]
struct ChannelState {
    next_id: SubscriptionId,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<ChannelMessage>>,
}

#[derive(Default)]
struct HubInner {
    channels: Mutex<HashMap<String, ChannelState>>,
}

/// In-process fan-out hub.
///
/// Every subscriber of a channel gets its own unbounded queue; publishing
/// clones the message into each live queue and prunes queues whose receiver
/// was dropped. The hub itself is cheap to clone and share.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    inner: Arc<HubInner>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a channel. Counts senders, so it may
    /// briefly include subscribers that dropped their receiver and have not
    /// been pruned by a publish yet.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.inner.channels.lock().unwrap();
        channels
            .get(channel)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }
}

impl Transport for InMemoryHub {
    fn channel(&self, name: &str) -> Arc<dyn Channel> {
        Arc::new(InMemoryChannel {
            name: name.to_string(),
            hub: Arc::clone(&self.inner),
        })
    }
}

struct InMemoryChannel {
    name: String,
    hub: Arc<HubInner>,
}

impl Channel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, event: &str, payload: Value) -> SyncResult<()> {
        let message = ChannelMessage {
            channel: self.name.clone(),
            event: event.to_string(),
            payload,
        };

        let mut channels = self.hub.channels.lock().unwrap();
        let Some(state) = channels.get_mut(&self.name) else {
            // Nobody listening; publishing into silence is fine.
            return Ok(());
        };

        state
            .subscribers
            .retain(|_, sender| sender.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> SyncResult<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut channels = self.hub.channels.lock().unwrap();
        let state = channels.entry(self.name.clone()).or_default();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, sender);

        Ok(Subscription { id, receiver })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut channels = self.hub.channels.lock().unwrap();
        if let Some(state) = channels.get_mut(&self.name) {
            state.subscribers.remove(&id);
            if state.subscribers.is_empty() {
                channels.remove(&self.name);
            }
        }
    }
}

impl std::fmt::Debug for InMemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.inner.channels.lock().unwrap();
        f.debug_struct("InMemoryHub")
            .field("channels", &channels.len())
            .finish()
    }
}
