//! `jobstream-core` — stream primitives shared by readers, listeners and stores.
//!
//! This crate contains **pure** building blocks (no IO, no async).

pub mod error;
pub mod id;
pub mod lifecycle;
pub mod record;

pub use error::CoreError;
pub use id::{Cursor, RecordId, now_ms};
pub use lifecycle::LifecycleState;
pub use record::StreamRecord;
