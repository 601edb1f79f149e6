//! Error types surfaced to callers of the detection engine
//!
//! Only configuration and registration problems are reported as errors.
//! Per-frame failures are absorbed inside the orchestrator and never reach here.

use thiserror::Error;

/// Synchronous rejections from the engine's public API
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// A detection method name that is not one of signature/keypoint/text/hybrid
    #[error("unknown detection method '{0}' (expected signature, keypoint, text or hybrid)")]
    UnknownMethod(String),

    /// An explicit call named a product that was never registered
    #[error("unknown product '{0}'")]
    UnknownProduct(String),

    /// Every reference image of a product failed to load
    #[error("no reference images could be loaded for product '{product_id}'")]
    NoReferencesLoaded { product_id: String },

    /// A product definition failed its required-field check
    #[error("invalid registration for product '{product_id}': {reason}")]
    InvalidRegistration { product_id: String, reason: String },

    /// A configuration value is out of its domain
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub(crate) fn invalid_registration(product_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRegistration {
            product_id: product_id.to_string(),
            reason: reason.into(),
        }
    }
}
