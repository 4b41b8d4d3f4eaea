//! Topic-keyed publish/subscribe registry (mechanics only).
//!
//! The hub is the local fan-out point of an event listener. Subscribers pick
//! a [`Topic`]: every event of one kind, every event of one kind about one
//! entity, or loop errors. Each subscription gets its own copy of every
//! message published to its topic (broadcast semantics).
//!
//! ## Delivery
//!
//! - **Unbounded**: publishing never blocks the listener loop
//! - **Best-effort**: subscribers whose receiving half was dropped are pruned
//!   on the next publish to their topic, and registry-wide on every subscribe,
//!   so per-job topics that are never published again do not pile up
//! - **Ordered per subscription**: messages arrive in publish order

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use jobstream_core::RecordId;

use crate::event::{EventKind, QueueEvent};

/// Address of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event of one kind.
    Kind(EventKind),
    /// Events of one kind concerning one entity (job id).
    Entity(EventKind, String),
    /// Unrecoverable loop failures and rejected starts.
    Error,
}

impl Topic {
    pub fn kind(kind: impl Into<EventKind>) -> Self {
        Topic::Kind(kind.into())
    }

    pub fn entity(kind: impl Into<EventKind>, entity_id: impl Into<String>) -> Self {
        Topic::Entity(kind.into(), entity_id.into())
    }
}

/// Message delivered to listener subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A decoded event and the id of the record it came from.
    Event { id: RecordId, event: QueueEvent },
    /// The queue drained. Carries no payload.
    Drained { id: RecordId },
    /// The listener hit a failure it cannot recover from.
    Error { message: String },
}

impl Notification {
    pub fn id(&self) -> Option<RecordId> {
        match self {
            Notification::Event { id, .. } | Notification::Drained { id } => Some(*id),
            Notification::Error { .. } => None,
        }
    }

    pub fn event(&self) -> Option<&QueueEvent> {
        match self {
            Notification::Event { event, .. } => Some(event),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Internal lock poisoning.
    #[error("subscriber registry lock poisoned")]
    Poisoned,
}

/// A subscription to one topic of a hub.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for up to `timeout`. `None` on timeout or when the hub is gone.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<M> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

/// In-process publish/subscribe registry keyed by [`Topic`].
#[derive(Debug)]
pub struct EventHub<M> {
    subscribers: Mutex<HashMap<Topic, Vec<mpsc::UnboundedSender<M>>>>,
}

impl<M> Default for EventHub<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

impl<M: Clone> EventHub<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned registry still hands out a subscription; it just never
        // receives anything.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|_, senders| {
                senders.retain(|tx| !tx.is_closed());
                !senders.is_empty()
            });
            subs.entry(topic).or_default().push(tx);
        }

        Subscription::new(rx)
    }

    /// Publish to every live subscriber of `topic`; returns how many got it.
    pub fn publish(&self, topic: &Topic, message: M) -> Result<usize, HubError> {
        let mut subs = self.subscribers.lock().map_err(|_| HubError::Poisoned)?;

        let Some(senders) = subs.get_mut(topic) else {
            return Ok(0);
        };
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        let delivered = senders.len();
        if delivered == 0 {
            subs.remove(topic);
        }

        Ok(delivered)
    }

    /// Number of topics with at least one registered subscriber.
    pub fn topic_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(topic).map_or(0, |s| s.iter().filter(|tx| !tx.is_closed()).count()))
            .unwrap_or(0)
    }
}

impl EventHub<Notification> {
    /// Route one decoded record to its topics.
    ///
    /// `drained` goes out as a bare id on its kind topic. Every other event
    /// goes to its kind topic and, when it names a job, again to the
    /// `(kind, job id)` entity topic with identical content.
    pub fn dispatch(&self, id: RecordId, event: QueueEvent) -> Result<usize, HubError> {
        let kind = event.kind();
        if kind == EventKind::Drained {
            return self.publish(&Topic::Kind(kind), Notification::Drained { id });
        }

        let entity_topic = event.job_id().map(|job_id| Topic::Entity(kind.clone(), job_id.to_string()));
        let notification = Notification::Event { id, event };

        let mut delivered = self.publish(&Topic::Kind(kind), notification.clone())?;
        if let Some(topic) = entity_topic {
            delivered += self.publish(&topic, notification)?;
        }
        Ok(delivered)
    }

    /// Publish a loop failure on the error topic.
    pub fn publish_error(&self, message: impl Into<String>) -> Result<usize, HubError> {
        self.publish(
            &Topic::Error,
            Notification::Error {
                message: message.into(),
            },
        )
    }
}
