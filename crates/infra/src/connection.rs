//! Connection context shared by readers, listeners and producers.
//!
//! A [`StreamContext`] owns:
//!
//! - the connector new connections are opened through
//! - one lazily connected shared client for short commands
//! - the queue's key namespace
//! - the root "closing" signal every loop built from it observes
//!
//! Loops that block on reads ask for a [`StreamContext::dedicated`]
//! connection instead of using the shared client.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use jobstream_core::LifecycleState;

use crate::config::StreamSettings;
use crate::stream_store::{ReconnectPolicy, ReconnectingStore, StoreConnector, StoreError, StreamStore};

/// Resolves stream names to store keys: `<prefix>:<queue>:<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
    queue: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            queue: queue.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.queue, name)
    }

    /// The queue's global event stream.
    pub fn events(&self) -> String {
        self.key("events")
    }
}

#[derive(Clone)]
pub struct StreamContext {
    connector: Arc<dyn StoreConnector>,
    policy: ReconnectPolicy,
    keys: KeyNamespace,
    client: Arc<ReconnectingStore>,
    closing: CancellationToken,
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("keys", &self.keys)
            .field("policy", &self.policy)
            .field("closing", &self.closing.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StreamContext {
    pub fn new(connector: Arc<dyn StoreConnector>, keys: KeyNamespace) -> Self {
        Self::with_policy(connector, keys, ReconnectPolicy::default())
    }

    pub fn with_policy(connector: Arc<dyn StoreConnector>, keys: KeyNamespace, policy: ReconnectPolicy) -> Self {
        let client = Arc::new(ReconnectingStore::new(connector.clone(), policy.clone()));
        Self {
            connector,
            policy,
            keys,
            client,
            closing: CancellationToken::new(),
        }
    }

    pub fn from_settings(connector: Arc<dyn StoreConnector>, settings: &StreamSettings) -> Self {
        Self::with_policy(
            connector,
            KeyNamespace::new(&settings.prefix, &settings.queue),
            settings.reconnect.clone(),
        )
    }

    pub fn keys(&self) -> &KeyNamespace {
        &self.keys
    }

    /// Shared client for non-blocking commands.
    pub fn client(&self) -> Arc<dyn StreamStore> {
        self.client.clone()
    }

    /// A new connection of its own, opened on first use.
    pub fn dedicated(&self) -> Arc<ReconnectingStore> {
        Arc::new(ReconnectingStore::new(self.connector.clone(), self.policy.clone()))
    }

    /// Signal cancelled when the context closes.
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Stop every loop built from this context and release the shared client.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.closing.cancel();
        self.client.quit().await
    }
}

/// Lifecycle state guarded for sharing between a handle and its loop.
#[derive(Debug)]
pub struct LifecycleCell(Mutex<LifecycleState>);

impl Default for LifecycleCell {
    fn default() -> Self {
        Self(Mutex::new(LifecycleState::NotStarted))
    }
}

impl LifecycleCell {
    pub fn get(&self) -> LifecycleState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the transition is legal; returns whether it moved.
    pub fn transition(&self, next: LifecycleState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}
