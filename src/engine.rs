//! Detection Orchestrator
//!
//! Owns the reference store, one matcher per method, the fusion combiner and
//! the stability tracker. A detection cycle runs the matchers selected by the
//! current `DetectionMethod`, fuses their candidates, and feeds the result to
//! the tracker. Per-frame failures are absorbed here; only configuration and
//! registration problems reach the caller.

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::analysis::{Decision, FusionCombiner, StabilityEvent, StabilityPhase, StabilityTracker};
use crate::capture::Frame;
use crate::config::AppConfig;
use crate::error::EngineError;
use crate::shared::ScanEvent;
use crate::storage::products::ProductCatalog;
use crate::vision::references::RegistrationSummary;
use crate::vision::{
    DetectionMethod, KeypointMatcher, MatchCandidate, MatchMethod, ProductRegistration, ReferenceStore,
    SignatureMatcher, TextMatcher, TextRecognizer,
};

/// Detection orchestrator
pub struct DetectionOrchestrator {
    method: DetectionMethod,
    store: Arc<RwLock<ReferenceStore>>,
    signature: Arc<SignatureMatcher>,
    keypoint: Arc<KeypointMatcher>,
    text: TextMatcher,
    fusion: FusionCombiner,
    tracker: StabilityTracker,
    subscribers: Mutex<Vec<Sender<ScanEvent>>>,
}

impl DetectionOrchestrator {
    /// Create an orchestrator with an empty reference store
    pub fn new(config: &AppConfig, recognizer: Arc<dyn TextRecognizer>) -> Result<Self, EngineError> {
        config.validate()?;

        Ok(Self {
            method: config.detection.method,
            store: Arc::new(RwLock::new(ReferenceStore::new(config))),
            signature: Arc::new(SignatureMatcher::new(config.signature.clone())),
            keypoint: Arc::new(KeypointMatcher::new(config.keypoint.clone())),
            text: TextMatcher::new(config.text.clone(), recognizer),
            fusion: FusionCombiner::new(config.fusion.clone()),
            tracker: StabilityTracker::new(config.stability.clone()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Register (or replace) one product
    pub fn register_product(&mut self, registration: ProductRegistration) -> Result<RegistrationSummary, EngineError> {
        let replacing = self.store.read().contains(registration.product_id.trim());
        let summary = self.store.write().register(registration)?;
        if replacing {
            self.keypoint.release_cache();
        }
        Ok(summary)
    }

    /// Register every product of a catalog.
    ///
    /// All definitions are checked before any image is decoded, so a
    /// malformed entry leaves the store untouched.
    pub fn register_catalog(&mut self, catalog: &ProductCatalog) -> Result<Vec<RegistrationSummary>, EngineError> {
        let registrations = catalog
            .products
            .iter()
            .map(|product| product.to_registration(&catalog.base_dir))
            .collect::<Result<Vec<_>, _>>()?;

        registrations
            .into_iter()
            .map(|registration| self.register_product(registration))
            .collect()
    }

    /// Drop a product from the store
    pub fn remove_product(&mut self, product_id: &str) -> Result<(), EngineError> {
        self.store
            .write()
            .remove(product_id)
            .ok_or_else(|| EngineError::UnknownProduct(product_id.to_string()))?;
        self.keypoint.release_cache();
        Ok(())
    }

    /// Switch detection strategy; resets tracking and releases cached reference data
    pub fn set_method(&mut self, method: DetectionMethod) {
        if method == self.method {
            return;
        }
        info!("Detection method changed: {} -> {}", self.method, method);
        self.method = method;
        self.tracker.reset();
        self.keypoint.release_cache();
    }

    pub fn method(&self) -> DetectionMethod {
        self.method
    }

    /// Shared handle to the reference store
    pub fn store(&self) -> Arc<RwLock<ReferenceStore>> {
        self.store.clone()
    }

    pub fn stability_phase(&self) -> &StabilityPhase {
        self.tracker.phase()
    }

    pub fn confirmed_product(&self) -> Option<&str> {
        self.tracker.confirmed_product()
    }

    /// Receive confirmed/cleared events
    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send an event to every live subscriber
    pub fn broadcast(&self, event: ScanEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Run the current method's matchers on one frame and fuse the result.
    ///
    /// Never fails: a matcher error counts as no candidate from that method.
    pub async fn detect(&self, frame: Arc<Frame>) -> Decision {
        let start = Instant::now();

        let candidates: Vec<MatchCandidate> = match self.method {
            DetectionMethod::Signature => self.run_signature(frame).await.into_iter().collect(),
            DetectionMethod::Keypoint => self.run_keypoint(frame).await.into_iter().collect(),
            DetectionMethod::Text => self.run_text(&frame).await.into_iter().collect(),
            DetectionMethod::Hybrid => {
                let (keypoint, text) = tokio::join!(self.run_keypoint(frame.clone()), self.run_text(&frame));
                keypoint.into_iter().chain(text).collect()
            }
        };

        let decision = self.fuse(candidates);
        debug!(
            "Detection cycle ({}) -> {:?} {:.3} via {} in {:?}",
            self.method,
            decision.product_id,
            decision.confidence,
            decision.method,
            start.elapsed()
        );
        decision
    }

    /// One full cycle: detect, track stability, and publish any transition
    pub async fn process_frame(&mut self, frame: Arc<Frame>) -> (Decision, Option<StabilityEvent>) {
        let decision = self.detect(frame).await;
        let event = self.tracker.observe(&decision);
        if let Some(event) = &event {
            self.broadcast(event.clone().into());
        }
        (decision, event)
    }

    /// Reset tracking to Idle, clearing any confirmed product
    pub fn stop(&mut self) {
        if let StabilityPhase::Confirmed { product_id, .. } = self.tracker.reset() {
            self.broadcast(ScanEvent::Cleared { product_id });
        }
    }

    fn fuse(&self, candidates: Vec<MatchCandidate>) -> Decision {
        let store = self.store.read();
        let known: Vec<MatchCandidate> = candidates
            .into_iter()
            .filter(|candidate| {
                let known = store.contains(&candidate.product_id);
                if !known {
                    warn!(
                        "Dropping {} candidate for unregistered product '{}'",
                        candidate.method, candidate.product_id
                    );
                }
                known
            })
            .collect();
        drop(store);
        self.fusion.combine(known)
    }

    async fn run_signature(&self, frame: Arc<Frame>) -> Option<MatchCandidate> {
        let matcher = self.signature.clone();
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || matcher.detect(&frame, &store.read())).await;
        absorb(MatchMethod::Signature, result)
    }

    async fn run_keypoint(&self, frame: Arc<Frame>) -> Option<MatchCandidate> {
        let matcher = self.keypoint.clone();
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || matcher.detect(&frame, &store.read())).await;
        absorb(MatchMethod::Keypoint, result)
    }

    async fn run_text(&self, frame: &Frame) -> Option<MatchCandidate> {
        let text = self.text.recognize(frame).await?;
        let store = self.store.read();
        self.text.match_text(&text, &store)
    }
}

fn absorb(
    method: MatchMethod,
    result: std::result::Result<Result<Option<MatchCandidate>>, JoinError>,
) -> Option<MatchCandidate> {
    match result {
        Ok(Ok(candidate)) => candidate,
        Ok(Err(e)) => {
            warn!("{} matcher failed: {:#}", method, e);
            None
        }
        Err(e) => {
            warn!("{} matcher aborted: {}", method, e);
            None
        }
    }
}
