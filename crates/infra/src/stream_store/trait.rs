use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use jobstream_core::{CoreError, Cursor, RecordId, StreamRecord};

/// Where a newly created consumer group starts delivering from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupStart {
    /// Only records appended after creation (`$`).
    Latest,
    /// The whole stream (`0`).
    Beginning,
    /// Records strictly after the given id.
    After(RecordId),
}

/// Which records a group read returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupSelector {
    /// Entries delivered to this consumer and not yet acknowledged, plus
    /// entries the store's claim rules hand over from idle group members.
    Pending,
    /// Records never delivered to any member of the group (`>`).
    New,
}

/// Bound of a range scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RangeBound {
    /// `-`
    Oldest,
    /// `+`
    Newest,
    /// Inclusive id bound.
    At(RecordId),
}

/// How an appended record gets its id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum IdSpec {
    /// Store-assigned (`*`): wall clock milliseconds plus a sequence.
    #[default]
    Auto,
    /// Caller-chosen; must be greater than the stream's last id.
    Explicit(RecordId),
}

/// Options for [`StreamStore::append`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct AppendOptions {
    pub id: IdSpec,
    /// Approximate cap on the stream length (`MAXLEN ~ n`).
    pub max_len: Option<u64>,
}

impl AppendOptions {
    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = IdSpec::Explicit(id);
        self
    }

    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

/// Stream store operation error.
///
/// Errors carry text rather than transport error values so they can be
/// cloned into both a task result and an error channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The connection failed or dropped. Retrying on a fresh connection may
    /// succeed.
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    /// The consumer group already exists (`BUSYGROUP`).
    #[error("consumer group already exists: {0}")]
    GroupExists(String),

    #[error("no such key or group: {0}")]
    NoSuchKey(String),

    #[error(transparent)]
    InvalidId(#[from] CoreError),

    /// The connection was closed on purpose.
    #[error("connection closed")]
    Closed,

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether the reconnect wrapper should retry the command.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

/// Append-only stream store with consumer groups.
///
/// This is the complete primitive set the readers and listeners are built
/// from. Implementations are one connection each: blocking reads occupy the
/// connection for their duration, so long-lived loops should get their own
/// via [`StoreConnector::connect`].
#[async_trait::async_trait]
pub trait StreamStore: Send + Sync {
    /// Create a consumer group. An existing group yields
    /// [`StoreError::GroupExists`].
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), StoreError>;

    /// Read as a member of a consumer group. `None` block means return
    /// immediately; an empty result means the wait timed out.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        selector: GroupSelector,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>, StoreError>;

    /// Acknowledge one record; returns how many entries left the pending list.
    async fn ack(&self, stream: &str, group: &str, id: RecordId) -> Result<u64, StoreError>;

    async fn range(
        &self,
        stream: &str,
        start: RangeBound,
        end: RangeBound,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError>;

    /// The record with the highest id, if the stream has any.
    async fn last(&self, stream: &str) -> Result<Option<StreamRecord>, StoreError>;

    /// Delete every record with id below `min_id`; returns how many went.
    async fn trim(&self, stream: &str, min_id: RecordId) -> Result<u64, StoreError>;

    async fn len(&self, stream: &str) -> Result<u64, StoreError>;

    /// Plain (non-group) read of records after `after`.
    async fn read(
        &self,
        stream: &str,
        after: Cursor,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>, StoreError>;

    async fn append(
        &self,
        stream: &str,
        options: AppendOptions,
        fields: &[(String, String)],
    ) -> Result<RecordId, StoreError>;

    /// Release the connection. Later commands fail with [`StoreError::Closed`].
    async fn quit(&self) -> Result<(), StoreError>;
}

/// Opens store connections.
#[async_trait::async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StreamStore>, StoreError>;
}
