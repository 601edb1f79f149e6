//! Fusion of per-method candidates into one decision

use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::config::FusionSettings;
use crate::vision::{clamp_unit, MatchCandidate, MatchMethod};

/// How a decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    /// No method produced a candidate
    None,
    /// Exactly one method produced a candidate
    Single(MatchMethod),
    /// Two methods named the same product
    Agreement { primary: MatchMethod, secondary: MatchMethod },
    /// Two methods named different products
    Conflict { winner: MatchMethod, loser: MatchMethod },
}

impl fmt::Display for DecisionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionMethod::None => f.write_str("none"),
            DecisionMethod::Single(method) => write!(f, "{}", method),
            DecisionMethod::Agreement { primary, secondary } => write!(f, "{}+{}", primary, secondary),
            DecisionMethod::Conflict { winner, loser } => write!(f, "{}>{}", winner, loser),
        }
    }
}

/// Single authoritative output of one detection cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub product_id: Option<String>,
    pub confidence: f32,
    pub method: DecisionMethod,
    /// Losing candidate of a conflict, kept for diagnostics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<MatchCandidate>,
}

impl Decision {
    /// Decision naming no product
    pub fn none() -> Self {
        Self {
            product_id: None,
            confidence: 0.0,
            method: DecisionMethod::None,
            rejected: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.product_id.is_some()
    }
}

impl Default for Decision {
    fn default() -> Self {
        Self::none()
    }
}

/// Fusion combiner
pub struct FusionCombiner {
    settings: FusionSettings,
}

impl FusionCombiner {
    pub fn new(settings: FusionSettings) -> Self {
        Self { settings }
    }

    /// Combine the candidates of one frame (at most one per method)
    pub fn combine(&self, mut candidates: Vec<MatchCandidate>) -> Decision {
        candidates.sort_by(|a, b| b.method.priority().cmp(&a.method.priority()));
        if candidates.len() > 2 {
            debug!("Fusing the two highest-priority of {} candidates", candidates.len());
            candidates.truncate(2);
        }

        let mut candidates = candidates.into_iter();
        match (candidates.next(), candidates.next()) {
            (None, _) => Decision::none(),
            (Some(only), None) => Decision {
                product_id: Some(only.product_id),
                confidence: only.confidence,
                method: DecisionMethod::Single(only.method),
                rejected: None,
            },
            (Some(primary), Some(secondary)) if primary.product_id == secondary.product_id => {
                self.agree(primary, secondary)
            }
            (Some(primary), Some(secondary)) => self.conflict(primary, secondary),
        }
    }

    fn agree(&self, primary: MatchCandidate, secondary: MatchCandidate) -> Decision {
        let s = &self.settings;
        let mut combined = primary.confidence * s.primary_weight
            + secondary.confidence * s.secondary_weight
            + s.agreement_bonus;
        if primary.confidence > s.primary_high_mark && secondary.confidence > s.secondary_high_mark {
            combined += s.high_confidence_bonus;
        }

        debug!(
            "Agreement on '{}': {} {:.3} + {} {:.3} -> {:.3}",
            primary.product_id, primary.method, primary.confidence, secondary.method, secondary.confidence, combined
        );

        Decision {
            product_id: Some(primary.product_id),
            confidence: clamp_unit(combined),
            method: DecisionMethod::Agreement {
                primary: primary.method,
                secondary: secondary.method,
            },
            rejected: None,
        }
    }

    fn conflict(&self, primary: MatchCandidate, secondary: MatchCandidate) -> Decision {
        let penalty = self.settings.conflict_penalty;
        let primary_score = clamp_unit(primary.confidence * penalty);
        let secondary_score = clamp_unit(secondary.confidence * penalty);

        let (winner, score, loser) = if secondary_score > primary_score {
            (secondary, secondary_score, primary)
        } else {
            (primary, primary_score, secondary)
        };

        debug!(
            "Conflict: '{}' ({}) beats '{}' ({}) at {:.3}",
            winner.product_id, winner.method, loser.product_id, loser.method, score
        );

        Decision {
            product_id: Some(winner.product_id),
            confidence: score,
            method: DecisionMethod::Conflict {
                winner: winner.method,
                loser: loser.method,
            },
            rejected: Some(loser),
        }
    }
}
