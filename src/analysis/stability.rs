//! Stability tracking
//!
//! Debounces per-frame decisions: a product must be named on several
//! consecutive frames before it is confirmed, and must be missing for several
//! frames before it is cleared.

use tracing::info;

use crate::analysis::fusion::Decision;
use crate::config::StabilitySettings;

/// Tracking phase
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StabilityPhase {
    #[default]
    Idle,
    Candidate {
        product_id: String,
        consecutive_matches: u32,
    },
    Confirmed {
        product_id: String,
        consecutive_misses: u32,
    },
}

/// Transition worth reporting
#[derive(Debug, Clone, PartialEq)]
pub enum StabilityEvent {
    Confirmed { product_id: String, confidence: f32 },
    Cleared { product_id: String },
}

/// Hysteresis state machine, one per scanning session
pub struct StabilityTracker {
    settings: StabilitySettings,
    phase: StabilityPhase,
}

impl StabilityTracker {
    pub fn new(settings: StabilitySettings) -> Self {
        Self {
            settings,
            phase: StabilityPhase::Idle,
        }
    }

    pub fn phase(&self) -> &StabilityPhase {
        &self.phase
    }

    /// Product currently confirmed, if any
    pub fn confirmed_product(&self) -> Option<&str> {
        match &self.phase {
            StabilityPhase::Confirmed { product_id, .. } => Some(product_id),
            _ => None,
        }
    }

    /// Return to Idle, handing back the phase that was left
    pub fn reset(&mut self) -> StabilityPhase {
        std::mem::take(&mut self.phase)
    }

    /// Feed one decision; at most one event per frame
    pub fn observe(&mut self, decision: &Decision) -> Option<StabilityEvent> {
        let observed = decision.product_id.as_deref();
        let (next, event) = match (std::mem::take(&mut self.phase), observed) {
            (StabilityPhase::Idle, None) => (StabilityPhase::Idle, None),

            (StabilityPhase::Idle, Some(id)) => self.begin(id, decision.confidence),

            (StabilityPhase::Candidate { product_id, consecutive_matches }, Some(id)) if product_id == id => {
                let matches = consecutive_matches + 1;
                if matches >= self.settings.confirm_frames {
                    self.confirm(product_id, decision.confidence)
                } else {
                    (
                        StabilityPhase::Candidate {
                            product_id,
                            consecutive_matches: matches,
                        },
                        None,
                    )
                }
            }

            // The switch frame carries the clear, so the new product always
            // starts as a candidate even when one frame would confirm it
            (StabilityPhase::Candidate { product_id, .. }, Some(id))
            | (StabilityPhase::Confirmed { product_id, .. }, Some(id))
                if product_id != id =>
            {
                info!("Product switched from '{}' to '{}'", product_id, id);
                (
                    StabilityPhase::Candidate {
                        product_id: id.to_string(),
                        consecutive_matches: 1,
                    },
                    Some(StabilityEvent::Cleared { product_id }),
                )
            }

            (StabilityPhase::Candidate { product_id, .. }, None) => {
                (StabilityPhase::Idle, Some(StabilityEvent::Cleared { product_id }))
            }

            (StabilityPhase::Confirmed { product_id, .. }, Some(_)) => (
                StabilityPhase::Confirmed {
                    product_id,
                    consecutive_misses: 0,
                },
                None,
            ),

            (StabilityPhase::Confirmed { product_id, consecutive_misses }, None) => {
                let misses = consecutive_misses + 1;
                if misses >= self.settings.hide_delay {
                    info!("Cleared '{}' after {} missed frames", product_id, misses);
                    (StabilityPhase::Idle, Some(StabilityEvent::Cleared { product_id }))
                } else {
                    (
                        StabilityPhase::Confirmed {
                            product_id,
                            consecutive_misses: misses,
                        },
                        None,
                    )
                }
            }

            // Same-product candidate is handled by the guarded arm above
            (StabilityPhase::Candidate { product_id, consecutive_matches }, Some(_)) => (
                StabilityPhase::Candidate {
                    product_id,
                    consecutive_matches,
                },
                None,
            ),
        };

        self.phase = next;
        event
    }

    fn begin(&self, product_id: &str, confidence: f32) -> (StabilityPhase, Option<StabilityEvent>) {
        if self.settings.confirm_frames <= 1 {
            return self.confirm(product_id.to_string(), confidence);
        }
        (
            StabilityPhase::Candidate {
                product_id: product_id.to_string(),
                consecutive_matches: 1,
            },
            None,
        )
    }

    fn confirm(&self, product_id: String, confidence: f32) -> (StabilityPhase, Option<StabilityEvent>) {
        info!("Confirmed '{}' ({:.2})", product_id, confidence);
        (
            StabilityPhase::Confirmed {
                product_id: product_id.clone(),
                consecutive_misses: 0,
            },
            Some(StabilityEvent::Confirmed { product_id, confidence }),
        )
    }
}
