//! Events published to presentation-layer subscribers

use crate::analysis::StabilityEvent;

/// Messages sent from the detection engine to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A scanning session started
    Started { session_id: String },
    /// A product became stable
    Confirmed { product_id: String, confidence: f32 },
    /// The shown product should be hidden
    Cleared { product_id: String },
    /// A scanning session ended
    Stopped { session_id: String },
}

impl From<StabilityEvent> for ScanEvent {
    fn from(event: StabilityEvent) -> Self {
        match event {
            StabilityEvent::Confirmed { product_id, confidence } => ScanEvent::Confirmed { product_id, confidence },
            StabilityEvent::Cleared { product_id } => ScanEvent::Cleared { product_id },
        }
    }
}
