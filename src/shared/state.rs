//! Runtime state of a scanning session

use serde::Serialize;

use crate::analysis::Decision;

/// Runtime state that is not persisted
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeState {
    /// Identifier of the session that owns this state
    pub session_id: String,
    /// Whether the frame loop is running
    pub is_scanning: bool,
    /// Detection cycles completed
    pub frames_processed: u64,
    /// Timer ticks skipped because a cycle was still in flight
    pub ticks_skipped: u64,
    /// Frames the source failed to deliver
    pub capture_errors: u64,
    /// Outcome of the most recent cycle
    pub last_decision: Option<Decision>,
    /// Product currently confirmed by the stability tracker
    pub confirmed_product: Option<String>,
    /// Last error message (if any)
    pub last_error: Option<String>,
}

impl RuntimeState {
    /// Clear any error state
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Set an error message
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}
