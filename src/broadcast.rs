// src/broadcast.rs
//! Fan-out of poll state changes to live subscribers.
//!
//! Every event is published to the poll's own topic (`poll_{id}`) and to the
//! global [`GLOBAL_TOPIC`]. Delivery is best effort: a subscriber that falls
//! more than the channel capacity behind loses the oldest events and has to
//! re-fetch the poll.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::models::{PollId, PollSnapshot, UserSummary};

pub const GLOBAL_TOPIC: &str = "polls_channel";

pub fn poll_topic(poll_id: PollId) -> String {
    format!("poll_{poll_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PollEvent {
    PollCreated { poll: PollSnapshot },
    PollUpdated { poll: PollSnapshot },
    PollDeleted { poll: PollSnapshot },
    VoteCast { poll: PollSnapshot, voter: UserSummary },
    VoteRemoved { poll: PollSnapshot, voter: UserSummary },
}

impl PollEvent {
    pub fn poll(&self) -> &PollSnapshot {
        match self {
            PollEvent::PollCreated { poll }
            | PollEvent::PollUpdated { poll }
            | PollEvent::PollDeleted { poll }
            | PollEvent::VoteCast { poll, .. }
            | PollEvent::VoteRemoved { poll, .. } => poll,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PollEvent::PollCreated { .. } => "poll_created",
            PollEvent::PollUpdated { .. } => "poll_updated",
            PollEvent::PollDeleted { .. } => "poll_deleted",
            PollEvent::VoteCast { .. } => "vote_cast",
            PollEvent::VoteRemoved { .. } => "vote_removed",
        }
    }
}

/// What a subscriber receives: the event, the topic it arrived on, and when it was emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub topic: String,
    #[serde(flatten)]
    pub event: PollEvent,
    pub timestamp: DateTime<Utc>,
}

/// Publish side of the fan-out, called only after the owning transaction committed.
pub trait Publisher: Send + Sync {
    fn publish(&self, envelope: EventEnvelope);

    /// Called once a topic can never see another event, e.g. after its poll was deleted.
    fn retire_topic(&self, _topic: &str) {}

    /// Drops topics nobody listens to. Returns how many were dropped.
    fn prune_idle_topics(&self) -> usize {
        0
    }
}

type Channels = HashMap<String, broadcast::Sender<Arc<EventEnvelope>>>;

/// In-process topic broadcaster backed by one tokio broadcast channel per topic.
pub struct Broadcaster {
    channels: RwLock<Channels>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<EventEnvelope>> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn topic_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Publisher for Broadcaster {
    fn publish(&self, envelope: EventEnvelope) {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        // No channel means nobody ever subscribed; nothing to deliver.
        let Some(sender) = channels.get(&envelope.topic) else {
            trace!(topic = %envelope.topic, "no subscribers");
            return;
        };
        let topic = envelope.topic.clone();
        let kind = envelope.event.kind();
        match sender.send(Arc::new(envelope)) {
            Ok(receivers) => debug!(%topic, kind, receivers, "event published"),
            Err(_) => trace!(%topic, kind, "all subscribers gone"),
        }
    }

    fn retire_topic(&self, topic: &str) {
        // Dropping the sender lets receivers drain what is buffered, then see Closed.
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    fn prune_idle_topics(&self) -> usize {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }
}
