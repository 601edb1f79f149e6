//! RetailLens - camera-based product recognition
//!
//! Several independent matchers (raster signatures, keypoints, recognized
//! text) each propose a product for a frame; their opinions are fused into one
//! decision and debounced into confirm/clear events.

pub mod analysis;
pub mod app;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod shared;
pub mod storage;
pub mod vision;

pub use analysis::{Decision, DecisionMethod, StabilityEvent};
pub use app::ScanSession;
pub use config::AppConfig;
pub use engine::DetectionOrchestrator;
pub use error::EngineError;
pub use shared::{RuntimeState, ScanEvent};
pub use vision::{DetectionMethod, MatchCandidate, MatchMethod, ProductRegistration};
