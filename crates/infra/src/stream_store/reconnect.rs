//! Reconnect-aware store wrapper.
//!
//! Connects lazily on first use. A command failing with a transient error
//! ([`StoreError::is_transient`]) drops the connection, waits, reconnects and
//! re-issues the command, up to the policy's attempt limit. Every other error
//! is returned unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use jobstream_core::{Cursor, RecordId, StreamRecord};

use super::r#trait::{
    AppendOptions, GroupSelector, GroupStart, RangeBound, StoreConnector, StoreError, StreamStore,
};

/// Retry policy for transient store failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Retries after the first failed attempt.
    pub max_attempts: u32,
    /// Pause before each reconnect, in milliseconds.
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 500,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// A lazily connected store that reconnects on transient failures.
pub struct ReconnectingStore {
    connector: Arc<dyn StoreConnector>,
    policy: ReconnectPolicy,
    conn: Mutex<Option<Arc<dyn StreamStore>>>,
    closed: AtomicBool,
}

impl ReconnectingStore {
    pub fn new(connector: Arc<dyn StoreConnector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a connection is currently established.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn connection(&self) -> Result<Arc<dyn StreamStore>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connector.connect().await?;
        debug!("store connection established");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the current connection (best-effort quit).
    async fn reset(&self) {
        let stale = self.conn.lock().await.take();
        if let Some(conn) = stale {
            let _ = conn.quit().await;
        }
    }

    fn should_retry(&self, err: &StoreError, attempt: u32) -> bool {
        err.is_transient() && attempt < self.policy.max_attempts && !self.closed.load(Ordering::SeqCst)
    }
}

/// Run one store call through the reconnect loop.
macro_rules! with_reconnect {
    ($self:ident, $op:literal, |$conn:ident| $call:expr) => {{
        let mut attempt = 0u32;
        loop {
            let outcome = match $self.connection().await {
                Ok($conn) => $call.await,
                Err(err) => Err(err),
            };
            match outcome {
                Err(err) if $self.should_retry(&err, attempt) => {
                    attempt += 1;
                    warn!(op = $op, attempt, error = %err, "transient store failure, reconnecting");
                    $self.reset().await;
                    tokio::time::sleep($self.policy.delay()).await;
                }
                other => break other,
            }
        }
    }};
}

#[async_trait::async_trait]
impl StreamStore for ReconnectingStore {
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), StoreError> {
        with_reconnect!(self, "create_group", |conn| conn.create_group(stream, group, start, mkstream))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        selector: GroupSelector,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        with_reconnect!(self, "read_group", |conn| conn
            .read_group(stream, group, consumer, selector, count, block))
    }

    async fn ack(&self, stream: &str, group: &str, id: RecordId) -> Result<u64, StoreError> {
        with_reconnect!(self, "ack", |conn| conn.ack(stream, group, id))
    }

    async fn range(
        &self,
        stream: &str,
        start: RangeBound,
        end: RangeBound,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        with_reconnect!(self, "range", |conn| conn.range(stream, start, end, count))
    }

    async fn last(&self, stream: &str) -> Result<Option<StreamRecord>, StoreError> {
        with_reconnect!(self, "last", |conn| conn.last(stream))
    }

    async fn trim(&self, stream: &str, min_id: RecordId) -> Result<u64, StoreError> {
        with_reconnect!(self, "trim", |conn| conn.trim(stream, min_id))
    }

    async fn len(&self, stream: &str) -> Result<u64, StoreError> {
        with_reconnect!(self, "len", |conn| conn.len(stream))
    }

    async fn read(
        &self,
        stream: &str,
        after: Cursor,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        with_reconnect!(self, "read", |conn| conn.read(stream, after, count, block))
    }

    async fn append(
        &self,
        stream: &str,
        options: AppendOptions,
        fields: &[(String, String)],
    ) -> Result<RecordId, StoreError> {
        with_reconnect!(self, "append", |conn| conn.append(stream, options, fields))
    }

    async fn quit(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn.lock().await.take();
        match conn {
            Some(conn) => conn.quit().await,
            None => Ok(()),
        }
    }
}
