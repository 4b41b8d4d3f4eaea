//! Component lifecycle shared by long-running stream loops.

use serde::Serialize;

/// Lifecycle of a stream loop.
///
/// `NotStarted → Running → Closing → Closed`; there is no way back to
/// `Running` within one instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Running,
    Closing,
    Closed,
}

impl LifecycleState {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (NotStarted, Closed)
                | (Running, Closing)
                | (Running, Closed)
                | (Closing, Closed)
        )
    }
}
