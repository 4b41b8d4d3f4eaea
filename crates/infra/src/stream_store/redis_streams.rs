//! Redis Streams-backed stream store.
//!
//! Each [`RedisStreamStore`] owns one multiplexed connection. Blocking reads
//! (`XREAD`/`XREADGROUP ... BLOCK`) hold that connection for their duration,
//! so loops that block get their own store through [`RedisConnector`].
//!
//! ## Command mapping
//!
//! - `create_group` → `XGROUP CREATE <key> <group> <$|0|id> [MKSTREAM]`
//! - `read_group(New)` → `XREADGROUP GROUP <g> <c> COUNT n BLOCK ms STREAMS <key> >`
//! - `read_group(Pending)` → `XREADGROUP ... STREAMS <key> 0`, topped up with
//!   `XAUTOCLAIM` for entries idle longer than the claim threshold
//! - `ack` → `XACK`, `range` → `XRANGE`, `last` → `XREVRANGE + - COUNT 1`,
//!   `trim` → `XTRIM MINID`,
//!   `len` → `XLEN`, `read` → `XREAD`, `append` → `XADD [MAXLEN ~ n]`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Value};
use tracing::{debug, instrument};

use jobstream_core::{Cursor, RecordId, StreamRecord};

use super::in_memory::DEFAULT_CLAIM_IDLE;
use super::r#trait::{
    AppendOptions, GroupSelector, GroupStart, IdSpec, RangeBound, StoreConnector, StoreError,
    StreamStore,
};

const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens Redis connections for stream stores.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: Client,
    claim_idle: Option<Duration>,
}

impl RedisConnector {
    /// Create a connector.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub fn open(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = Client::open(redis_url.as_ref()).map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            claim_idle: Some(DEFAULT_CLAIM_IDLE),
        })
    }

    /// Idle time after which pending entries of other group members are
    /// claimed by pending reads. `None` disables claiming.
    pub fn with_claim_idle(mut self, claim_idle: Option<Duration>) -> Self {
        self.claim_idle = claim_idle;
        self
    }
}

#[async_trait::async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn StreamStore>, StoreError> {
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Arc::new(RedisStreamStore {
            conn,
            claim_idle: self.claim_idle,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One Redis connection speaking the stream commands.
pub struct RedisStreamStore {
    conn: MultiplexedConnection,
    claim_idle: Option<Duration>,
    closed: AtomicBool,
}

impl RedisStreamStore {
    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(self.conn.clone())
    }

    async fn query(&self, cmd: &redis::Cmd) -> Result<Value, StoreError> {
        let mut conn = self.connection()?;
        cmd.query_async::<_, Value>(&mut conn).await.map_err(map_redis_error)
    }

    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count);

        // Reply: [next-cursor, [entries...], [deleted ids...]]
        match self.query(&cmd).await? {
            Value::Bulk(parts) => match parts.into_iter().nth(1) {
                Some(entries) => Ok(parse_entries(entries)?
                    .into_iter()
                    .filter(|r| !r.is_tombstone())
                    .collect()),
                None => Ok(Vec::new()),
            },
            Value::Nil => Ok(Vec::new()),
            other => Err(unexpected("XAUTOCLAIM", &other)),
        }
    }
}

#[async_trait::async_trait]
impl StreamStore for RedisStreamStore {
    #[instrument(skip(self), err)]
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), StoreError> {
        let start = match start {
            GroupStart::Latest => "$".to_string(),
            GroupStart::Beginning => "0".to_string(),
            GroupStart::After(id) => id.to_string(),
        };

        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start);
        if mkstream {
            cmd.arg("MKSTREAM");
        }
        self.query(&cmd).await?;
        Ok(())
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
        let count = count.max(1);
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);

        match selector {
            GroupSelector::Pending => {
                cmd.arg("STREAMS").arg(stream).arg("0");
                let mut records = parse_read_reply(self.query(&cmd).await?, stream)?;

                if let Some(idle) = self.claim_idle.filter(|_| records.len() < count) {
                    let claimed = self
                        .autoclaim(stream, group, consumer, idle, count - records.len())
                        .await?;
                    if !claimed.is_empty() {
                        debug!(stream, group, consumer, claimed = claimed.len(), "claimed idle entries");
                    }
                    records.extend(claimed);
                    records.sort_by_key(|r| r.id);
                    records.dedup_by_key(|r| r.id);
                }
                Ok(records)
            }
            GroupSelector::New => {
                if let Some(block) = block {
                    cmd.arg("BLOCK").arg(block.as_millis() as u64);
                }
                cmd.arg("STREAMS").arg(stream).arg(">");
                parse_read_reply(self.query(&cmd).await?, stream)
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: RecordId) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(id.to_string());
        integer("XACK", self.query(&cmd).await?)
    }

    async fn range(
        &self,
        stream: &str,
        start: RangeBound,
        end: RangeBound,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream)
            .arg(bound_arg(start))
            .arg(bound_arg(end))
            .arg("COUNT")
            .arg(count);
        parse_entries(self.query(&cmd).await?)
    }

    async fn last(&self, stream: &str) -> Result<Option<StreamRecord>, StoreError> {
        let mut cmd = redis::cmd("XREVRANGE");
        cmd.arg(stream).arg("+").arg("-").arg("COUNT").arg(1);
        Ok(parse_entries(self.query(&cmd).await?)?.into_iter().next())
    }

    #[instrument(skip(self, min_id), fields(min_id = %min_id), err)]
    async fn trim(&self, stream: &str, min_id: RecordId) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("XTRIM");
        cmd.arg(stream).arg("MINID").arg(min_id.to_string());
        integer("XTRIM", self.query(&cmd).await?)
    }

    async fn len(&self, stream: &str) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("XLEN");
        cmd.arg(stream);
        integer("XLEN", self.query(&cmd).await?)
    }

    async fn read(
        &self,
        stream: &str,
        after: Cursor,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        let mut cmd = redis::cmd("XREAD");
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(after.to_string());
        parse_read_reply(self.query(&cmd).await?, stream)
    }

    #[instrument(skip(self, fields), err)]
    async fn append(
        &self,
        stream: &str,
        options: AppendOptions,
        fields: &[(String, String)],
    ) -> Result<RecordId, StoreError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = options.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        match options.id {
            IdSpec::Auto => cmd.arg("*"),
            IdSpec::Explicit(id) => cmd.arg(id.to_string()),
        };
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }

        let reply = self.query(&cmd).await?;
        let id = text(&reply).ok_or_else(|| unexpected("XADD", &reply))?;
        Ok(id.parse()?)
    }

    async fn quit(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        // A blocked read still in flight delays the reply; the socket goes
        // away with the last handle either way.
        let quit = redis::cmd("QUIT");
        let _ = tokio::time::timeout(QUIT_TIMEOUT, quit.query_async::<_, Value>(&mut conn)).await;
        Ok(())
    }
}

fn map_redis_error(e: RedisError) -> StoreError {
    match e.code() {
        Some("BUSYGROUP") => StoreError::GroupExists(e.to_string()),
        Some("NOGROUP") => StoreError::NoSuchKey(e.to_string()),
        _ if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() => {
            StoreError::Connection(e.to_string())
        }
        _ => StoreError::Command(e.to_string()),
    }
}

fn bound_arg(bound: RangeBound) -> String {
    match bound {
        RangeBound::Oldest => "-".to_string(),
        RangeBound::Newest => "+".to_string(),
        RangeBound::At(id) => id.to_string(),
    }
}

fn unexpected(command: &str, value: &Value) -> StoreError {
    StoreError::Command(format!("unexpected {command} reply: {value:?}"))
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        Value::Status(status) => Some(status.clone()),
        _ => None,
    }
}

fn integer(command: &str, value: Value) -> Result<u64, StoreError> {
    match value {
        Value::Int(n) => Ok(u64::try_from(n).unwrap_or(0)),
        other => Err(unexpected(command, &other)),
    }
}

/// Parse an `XREAD`/`XREADGROUP` reply: `[[key, [entry...]], ...]` or nil on timeout.
fn parse_read_reply(value: Value, stream: &str) -> Result<Vec<StreamRecord>, StoreError> {
    let streams = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => return Err(unexpected("XREAD", &other)),
    };

    for entry in streams {
        let Value::Bulk(mut pair) = entry else {
            continue;
        };
        if pair.len() != 2 {
            continue;
        }
        let entries = pair.pop().unwrap_or(Value::Nil);
        if text(&pair[0]).as_deref() == Some(stream) {
            return parse_entries(entries);
        }
    }
    Ok(Vec::new())
}

fn parse_entries(value: Value) -> Result<Vec<StreamRecord>, StoreError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(entries) => entries.into_iter().map(parse_entry).collect(),
        other => Err(unexpected("stream entries", &other)),
    }
}

/// Parse one entry: `[id, [field1, value1, field2, value2, ...]]`.
///
/// An entry trimmed while still pending comes back as `[id, nil]` and yields a
/// record with no fields.
fn parse_entry(value: Value) -> Result<StreamRecord, StoreError> {
    let Value::Bulk(parts) = value else {
        return Err(unexpected("stream entry", &value));
    };
    let mut parts = parts.into_iter();

    let id = parts
        .next()
        .as_ref()
        .and_then(text)
        .ok_or_else(|| StoreError::Command("stream entry without id".to_string()))?
        .parse::<RecordId>()?;

    let fields = match parts.next() {
        Some(Value::Bulk(values)) => values
            .chunks(2)
            .filter_map(|chunk| match chunk {
                [key, value] => Some((text(key)?, text(value)?)),
                _ => None,
            })
            .collect(),
        Some(Value::Nil) | None => Vec::new(),
        Some(other) => return Err(unexpected("stream entry fields", &other)),
    };

    Ok(StreamRecord::new(id, fields))
}
