//! Typed queue events carried on the global events stream.
//!
//! Every record on the events stream has an `event` field naming its kind and
//! a kind-specific set of payload fields. Known kinds decode into dedicated
//! [`QueueEvent`] variants when their fields fit exactly; anything else is
//! preserved as [`QueueEvent::Raw`] so no record or field is ever dropped.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Kind of a queue event (the value of the `event` field).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Waiting,
    Active,
    Progress,
    Completed,
    Failed,
    Delayed,
    Stalled,
    Removed,
    WaitingChildren,
    Duplicated,
    Deduplicated,
    RetriesExhausted,
    Cleaned,
    Paused,
    Resumed,
    Drained,
    Unknown(String),
}

impl EventKind {
    /// Every kind this crate knows how to decode.
    pub const KNOWN: [EventKind; 17] = [
        EventKind::Added,
        EventKind::Waiting,
        EventKind::Active,
        EventKind::Progress,
        EventKind::Completed,
        EventKind::Failed,
        EventKind::Delayed,
        EventKind::Stalled,
        EventKind::Removed,
        EventKind::WaitingChildren,
        EventKind::Duplicated,
        EventKind::Deduplicated,
        EventKind::RetriesExhausted,
        EventKind::Cleaned,
        EventKind::Paused,
        EventKind::Resumed,
        EventKind::Drained,
    ];

    pub fn parse(name: &str) -> Self {
        match name {
            "added" => EventKind::Added,
            "waiting" => EventKind::Waiting,
            "active" => EventKind::Active,
            "progress" => EventKind::Progress,
            "completed" => EventKind::Completed,
            "failed" => EventKind::Failed,
            "delayed" => EventKind::Delayed,
            "stalled" => EventKind::Stalled,
            "removed" => EventKind::Removed,
            "waiting-children" => EventKind::WaitingChildren,
            "duplicated" => EventKind::Duplicated,
            "deduplicated" => EventKind::Deduplicated,
            "retries-exhausted" => EventKind::RetriesExhausted,
            "cleaned" => EventKind::Cleaned,
            "paused" => EventKind::Paused,
            "resumed" => EventKind::Resumed,
            "drained" => EventKind::Drained,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Added => "added",
            EventKind::Waiting => "waiting",
            EventKind::Active => "active",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Delayed => "delayed",
            EventKind::Stalled => "stalled",
            EventKind::Removed => "removed",
            EventKind::WaitingChildren => "waiting-children",
            EventKind::Duplicated => "duplicated",
            EventKind::Deduplicated => "deduplicated",
            EventKind::RetriesExhausted => "retries-exhausted",
            EventKind::Cleaned => "cleaned",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Drained => "drained",
            EventKind::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Unknown(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        EventKind::parse(value)
    }
}

/// A decoded queue event.
///
/// Payload field names follow the wire format (`jobId`, `returnvalue`,
/// `failedReason`, ...). `data` and `returnvalue` hold structured JSON; all
/// other values are text on the wire, numeric ones are parsed leniently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum QueueEvent {
    #[serde(rename_all = "camelCase")]
    Added {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Waiting {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Active {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: String,
        #[serde(default)]
        data: JsonValue,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: String,
        #[serde(default)]
        returnvalue: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        job_id: String,
        #[serde(default)]
        failed_reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Delayed {
        job_id: String,
        #[serde(deserialize_with = "lenient::u64")]
        delay: u64,
    },
    #[serde(rename_all = "camelCase")]
    Stalled { job_id: String },
    #[serde(rename_all = "camelCase")]
    Removed {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WaitingChildren { job_id: String },
    #[serde(rename_all = "camelCase")]
    Duplicated { job_id: String },
    #[serde(rename_all = "camelCase")]
    Deduplicated {
        job_id: String,
        deduplication_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RetriesExhausted {
        job_id: String,
        #[serde(deserialize_with = "lenient::u64")]
        attempts_made: u64,
    },
    Cleaned {
        #[serde(deserialize_with = "lenient::u64")]
        count: u64,
    },
    Paused,
    Resumed,
    Drained,
    /// An event kept as its decoded fields: a kind this version does not
    /// model, or a known kind whose fields do not fit its variant.
    #[serde(skip)]
    Raw {
        event: String,
        fields: Map<String, JsonValue>,
    },
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::Added { .. } => EventKind::Added,
            QueueEvent::Waiting { .. } => EventKind::Waiting,
            QueueEvent::Active { .. } => EventKind::Active,
            QueueEvent::Progress { .. } => EventKind::Progress,
            QueueEvent::Completed { .. } => EventKind::Completed,
            QueueEvent::Failed { .. } => EventKind::Failed,
            QueueEvent::Delayed { .. } => EventKind::Delayed,
            QueueEvent::Stalled { .. } => EventKind::Stalled,
            QueueEvent::Removed { .. } => EventKind::Removed,
            QueueEvent::WaitingChildren { .. } => EventKind::WaitingChildren,
            QueueEvent::Duplicated { .. } => EventKind::Duplicated,
            QueueEvent::Deduplicated { .. } => EventKind::Deduplicated,
            QueueEvent::RetriesExhausted { .. } => EventKind::RetriesExhausted,
            QueueEvent::Cleaned { .. } => EventKind::Cleaned,
            QueueEvent::Paused => EventKind::Paused,
            QueueEvent::Resumed => EventKind::Resumed,
            QueueEvent::Drained => EventKind::Drained,
            QueueEvent::Raw { event, .. } => EventKind::parse(event),
        }
    }

    /// Entity (job) the event refers to, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            QueueEvent::Added { job_id, .. }
            | QueueEvent::Waiting { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Delayed { job_id, .. }
            | QueueEvent::Stalled { job_id }
            | QueueEvent::Removed { job_id, .. }
            | QueueEvent::WaitingChildren { job_id }
            | QueueEvent::Duplicated { job_id }
            | QueueEvent::Deduplicated { job_id, .. }
            | QueueEvent::RetriesExhausted { job_id, .. } => Some(job_id),
            QueueEvent::Raw { fields, .. } => fields.get("jobId").and_then(JsonValue::as_str),
            QueueEvent::Cleaned { .. }
            | QueueEvent::Paused
            | QueueEvent::Resumed
            | QueueEvent::Drained => None,
        }
    }
}

/// Deserializers accepting both JSON numbers and their text form.
mod lenient {
    use serde::{Deserialize, Deserializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(u64),
        Text(String),
    }

    pub(super) fn u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match NumberOrText::deserialize(deserializer)? {
            NumberOrText::Number(n) => Ok(n),
            NumberOrText::Text(s) => s.trim().parse().map_err(de::Error::custom),
        }
    }
}
