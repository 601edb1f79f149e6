//! Analysis Layer
//!
//! Turns per-method candidates into decisions and decisions into stable
//! confirm/clear events.

pub mod fusion;
pub mod stability;
pub mod validation;

pub use fusion::{Decision, DecisionMethod, FusionCombiner};
pub use stability::{StabilityEvent, StabilityPhase, StabilityTracker};
pub use validation::{validate_dataset, ValidationReport};
