//! Stream records as returned by the store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::RecordId;

/// A record stored in an append-only stream.
///
/// Fields keep their append order; the same key may in principle appear more
/// than once, in which case the last occurrence wins in [`StreamRecord::to_map`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: RecordId,
    pub fields: Vec<(String, String)>,
}

impl StreamRecord {
    pub fn new(id: RecordId, fields: Vec<(String, String)>) -> Self {
        Self { id, fields }
    }

    /// Value of the last occurrence of `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Flatten the field list into a map.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.fields.iter().cloned().collect()
    }

    /// True when the store returned the id without content (entry trimmed
    /// while still pending).
    pub fn is_tombstone(&self) -> bool {
        self.fields.is_empty()
    }
}
