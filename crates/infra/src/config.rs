//! Configuration for readers, listeners and connections.
//!
//! Every struct has working defaults; [`StreamSettings::from_env`] overlays
//! environment variables on top of them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobstream_core::{Cursor, RecordId};

use crate::stream_store::ReconnectPolicy;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_PREFIX: &str = "bull";
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

/// Consumer group reader tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GroupReaderConfig {
    /// Records fetched per read.
    pub batch_size: usize,
    /// How long a read for new records waits before coming back empty.
    pub block_time_ms: u64,
    /// Records older than this are acknowledged without processing, and
    /// trimmed from the stream.
    pub max_retention_ms: u64,
    /// Minimum spacing between two trim passes.
    pub trim_interval_ms: u64,
    /// Field holding the JSON payload handed to the callback.
    pub payload_field: String,
    /// Pause after a pass where nothing succeeded.
    pub failure_backoff_ms: u64,
    /// Reported errors held for the caller; newer ones are dropped while full.
    pub error_backlog: usize,
}

impl Default for GroupReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            block_time_ms: 1_000,
            max_retention_ms: 24 * 60 * 60 * 1_000,
            trim_interval_ms: 60_000,
            payload_field: "data".to_string(),
            failure_backoff_ms: 1_000,
            error_backlog: 64,
        }
    }
}

impl GroupReaderConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block_time(mut self, block: Duration) -> Self {
        self.block_time_ms = millis(block);
        self
    }

    pub fn with_max_retention(mut self, retention: Duration) -> Self {
        self.max_retention_ms = millis(retention);
        self
    }

    pub fn with_trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval_ms = millis(interval);
        self
    }

    pub fn with_payload_field(mut self, field: impl Into<String>) -> Self {
        self.payload_field = field.into();
        self
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff_ms = millis(backoff);
        self
    }

    pub fn with_error_backlog(mut self, backlog: usize) -> Self {
        self.error_backlog = backlog.max(1);
        self
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

/// Event stream listener tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Resume after this id. `None` starts at the end of the stream.
    pub last_event_id: Option<RecordId>,
    /// Upper bound of one blocking read.
    pub blocking_timeout_ms: u64,
    /// Start reading as soon as the listener is built.
    pub autorun: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            last_event_id: None,
            blocking_timeout_ms: 10_000,
            autorun: true,
        }
    }
}

impl ListenerConfig {
    pub fn with_last_event_id(mut self, id: RecordId) -> Self {
        self.last_event_id = Some(id);
        self
    }

    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout_ms = millis(timeout);
        self
    }

    pub fn with_autorun(mut self, autorun: bool) -> Self {
        self.autorun = autorun;
        self
    }

    pub fn initial_cursor(&self) -> Cursor {
        self.last_event_id.map_or(Cursor::Latest, Cursor::After)
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }
}

/// Everything a process needs to reach one queue's streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamSettings {
    pub redis_url: String,
    pub prefix: String,
    pub queue: String,
    pub reader: GroupReaderConfig,
    pub listener: ListenerConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            reader: GroupReaderConfig::default(),
            listener: ListenerConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl StreamSettings {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(url) = lookup("REDIS_URL") {
            settings.redis_url = url;
        }
        if let Some(prefix) = lookup("JOBSTREAM_PREFIX") {
            settings.prefix = prefix;
        }
        if let Some(queue) = lookup("JOBSTREAM_QUEUE") {
            settings.queue = queue;
        }

        if let Some(n) = parsed::<usize>(&lookup, "JOBSTREAM_BATCH_SIZE")? {
            settings.reader.batch_size = n.max(1);
        }
        if let Some(ms) = parsed(&lookup, "JOBSTREAM_BLOCK_TIME_MS")? {
            settings.reader.block_time_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "JOBSTREAM_MAX_RETENTION_MS")? {
            settings.reader.max_retention_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "JOBSTREAM_TRIM_INTERVAL_MS")? {
            settings.reader.trim_interval_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "JOBSTREAM_BLOCKING_TIMEOUT_MS")? {
            settings.listener.blocking_timeout_ms = ms;
        }
        if let Some(raw) = lookup("JOBSTREAM_LAST_EVENT_ID") {
            let cursor: Cursor = raw.parse().map_err(|e: jobstream_core::CoreError| ConfigError::Invalid {
                var: "JOBSTREAM_LAST_EVENT_ID".to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })?;
            settings.listener.last_event_id = cursor.last_id();
        }

        Ok(settings)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
        var: var.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
