//! Typed queue events and their local fan-out.

pub mod codec;
pub mod event;
pub mod hub;

pub use codec::{EVENT_FIELD, EventCodecError, JSON_FIELDS, decode_fields, encode_object};
pub use event::{EventKind, QueueEvent};
pub use hub::{EventHub, HubError, Notification, Subscription, Topic};
