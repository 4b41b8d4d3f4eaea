//! Infrastructure layer: stream stores, consumer group readers, event
//! listeners, producers and their configuration.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod listener;
pub mod producer;
pub mod stream_store;

mod integration_tests;

pub use config::{ConfigError, GroupReaderConfig, ListenerConfig, StreamSettings};
pub use connection::{KeyNamespace, LifecycleCell, StreamContext};
pub use consumer::{ConsumeHandle, GroupReader, GroupRecord, ReaderError, TrimOutcome, TrimSchedule, trim_expired};
pub use listener::{EventStreamListener, ListenerError};
pub use producer::{DEFAULT_MAX_EVENTS, EventProducer, ProducerError, RecordProducer};
pub use stream_store::{
    InMemoryStreamStore, ReconnectPolicy, ReconnectingStore, StoreConnector, StoreError, StreamStore,
};
