//! Core error model.

use thiserror::Error;

/// Error raised by the core stream primitives.
///
/// Only deterministic, input-level failures live here. Transport and store
/// failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A record id could not be parsed (expected `<ms>-<seq>`).
    #[error("invalid record id: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
