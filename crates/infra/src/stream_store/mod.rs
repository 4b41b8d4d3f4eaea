//! Append-only stream store boundary.
//!
//! Readers, listeners and producers only ever talk to a [`StreamStore`]. The
//! in-memory store backs tests and local development; the Redis store
//! (feature `redis`) is the production adapter.

pub mod in_memory;
pub mod reconnect;
pub mod r#trait;

#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::{DEFAULT_CLAIM_IDLE, InMemoryStreamStore};
pub use reconnect::{ReconnectPolicy, ReconnectingStore};
pub use r#trait::{
    AppendOptions, GroupSelector, GroupStart, IdSpec, RangeBound, StoreConnector, StoreError,
    StreamStore,
};

#[cfg(feature = "redis")]
pub use redis_streams::{RedisConnector, RedisStreamStore};
