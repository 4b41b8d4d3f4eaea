//! Flat stream fields ⇄ JSON object ⇄ [`QueueEvent`].

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::event::{EventKind, QueueEvent};

/// Field holding the event kind.
pub const EVENT_FIELD: &str = "event";

/// Fields whose wire value is JSON text (progress payload, return value).
pub const JSON_FIELDS: [&str; 2] = ["data", "returnvalue"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventCodecError {
    #[error("record has no `event` field")]
    MissingKind,

    #[error("`event` field is not text")]
    InvalidKind,

    #[error("failed to encode event: {0}")]
    Encode(String),
}

/// Turn flat stream fields into a JSON object.
///
/// Known JSON fields are parsed into structured values; text that is not
/// valid JSON is kept verbatim. Every other field stays a string.
pub fn decode_fields(fields: &[(String, String)]) -> Map<String, JsonValue> {
    let mut object = Map::new();
    for (key, raw) in fields {
        let value = if JSON_FIELDS.contains(&key.as_str()) {
            match serde_json::from_str(raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(field = %key, error = %e, "field is not JSON, keeping text");
                    JsonValue::String(raw.clone())
                }
            }
        } else {
            JsonValue::String(raw.clone())
        };
        object.insert(key.clone(), value);
    }
    object
}

/// Flatten a JSON object into stream fields (inverse of [`decode_fields`]).
///
/// `event` goes first; nulls are dropped.
pub fn encode_object(object: &Map<String, JsonValue>) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(object.len());
    if let Some(JsonValue::String(kind)) = object.get(EVENT_FIELD) {
        fields.push((EVENT_FIELD.to_string(), kind.clone()));
    }
    for (key, value) in object {
        if key == EVENT_FIELD || value.is_null() {
            continue;
        }
        let text = match value {
            JsonValue::String(s) if !JSON_FIELDS.contains(&key.as_str()) => s.clone(),
            other => other.to_string(),
        };
        fields.push((key.clone(), text));
    }
    fields
}

impl QueueEvent {
    /// Decode a record's fields into a typed event.
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, EventCodecError> {
        Self::from_object(decode_fields(fields))
    }

    /// Decode an already-flattened object. The `event` field selects the variant.
    ///
    /// Fields that do not fit the kind's variant (missing, malformed or
    /// unmodelled) yield [`QueueEvent::Raw`] carrying every field as decoded.
    pub fn from_object(mut object: Map<String, JsonValue>) -> Result<Self, EventCodecError> {
        let event = match object.get(EVENT_FIELD) {
            Some(JsonValue::String(name)) => name.clone(),
            Some(_) => return Err(EventCodecError::InvalidKind),
            None => return Err(EventCodecError::MissingKind),
        };

        let kind = EventKind::parse(&event);
        if kind.is_known() {
            if let Some(typed) = typed(&kind, &object) {
                return Ok(typed);
            }
        }

        object.remove(EVENT_FIELD);
        Ok(QueueEvent::Raw { event, fields: object })
    }

    /// Encode into flat stream fields.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>, EventCodecError> {
        let object = match self {
            QueueEvent::Raw { event, fields } => {
                let mut object = fields.clone();
                object.insert(EVENT_FIELD.to_string(), JsonValue::String(event.clone()));
                object
            }
            known => match serde_json::to_value(known) {
                Ok(JsonValue::Object(object)) => object,
                Ok(other) => {
                    return Err(EventCodecError::Encode(format!("expected object, got {other}")));
                }
                Err(e) => return Err(EventCodecError::Encode(e.to_string())),
            },
        };
        Ok(encode_object(&object))
    }
}

/// The kind's variant, if it accounts for every field of `object`.
fn typed(kind: &EventKind, object: &Map<String, JsonValue>) -> Option<QueueEvent> {
    let event: QueueEvent = match serde_json::from_value(JsonValue::Object(object.clone())) {
        Ok(event) => event,
        Err(e) => {
            debug!(%kind, error = %e, "fields do not fit the event, keeping them raw");
            return None;
        }
    };
    let Ok(JsonValue::Object(modelled)) = serde_json::to_value(&event) else {
        return None;
    };
    if let Some(extra) = object.keys().find(|key| !modelled.contains_key(*key)) {
        debug!(%kind, field = %extra, "event carries an unmodelled field, keeping it raw");
        return None;
    }
    Some(event)
}
