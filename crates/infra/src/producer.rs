//! Appending to record streams and the event stream.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use jobstream_core::RecordId;
use jobstream_events::{EventCodecError, QueueEvent};

use crate::connection::StreamContext;
use crate::stream_store::{AppendOptions, StoreError, StreamStore};

/// Approximate cap on the events stream length.
pub const DEFAULT_MAX_EVENTS: u64 = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProducerError {
    #[error(transparent)]
    Codec(#[from] EventCodecError),

    #[error("failed to encode payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Publishes [`QueueEvent`]s to a queue's event stream.
pub struct EventProducer {
    store: Arc<dyn StreamStore>,
    stream: String,
    max_events: u64,
}

impl EventProducer {
    pub fn new(ctx: &StreamContext) -> Self {
        Self {
            store: ctx.client(),
            stream: ctx.keys().events(),
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub async fn publish(&self, event: &QueueEvent) -> Result<RecordId, ProducerError> {
        let fields = event.to_fields()?;
        let options = AppendOptions::default().with_max_len(self.max_events);
        let id = self.store.append(&self.stream, options, &fields).await?;
        debug!(stream = %self.stream, %id, kind = %event.kind(), "event published");
        Ok(id)
    }
}

/// Appends JSON payloads to a record stream consumed by a
/// [`GroupReader`](crate::consumer::GroupReader).
pub struct RecordProducer {
    store: Arc<dyn StreamStore>,
    stream: String,
    payload_field: String,
}

impl RecordProducer {
    /// Producer for the stream `name` in the context's key namespace.
    pub fn new(ctx: &StreamContext, name: &str) -> Self {
        Self {
            store: ctx.client(),
            stream: ctx.keys().key(name),
            payload_field: "data".to_string(),
        }
    }

    pub fn with_payload_field(mut self, field: impl Into<String>) -> Self {
        self.payload_field = field.into();
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub async fn append<T: Serialize>(&self, payload: &T) -> Result<RecordId, ProducerError> {
        self.append_with(AppendOptions::default(), payload).await
    }

    /// Append under a caller-chosen id, which must exceed the stream's last id.
    pub async fn append_at<T: Serialize>(&self, id: RecordId, payload: &T) -> Result<RecordId, ProducerError> {
        self.append_with(AppendOptions::default().with_id(id), payload).await
    }

    async fn append_with<T: Serialize>(&self, options: AppendOptions, payload: &T) -> Result<RecordId, ProducerError> {
        let json = serde_json::to_string(payload).map_err(|e| ProducerError::Payload(e.to_string()))?;
        let fields = [(self.payload_field.clone(), json)];
        Ok(self.store.append(&self.stream, options, &fields).await?)
    }
}
