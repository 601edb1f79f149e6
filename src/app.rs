//! Scan Session
//!
//! Drives the frame loop of one scanning session: a fixed-interval timer pulls
//! frames from a source and hands them to the orchestrator. Only one cycle may
//! be in flight; a tick that finds the previous cycle still running is skipped.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{Frame, FrameSource};
use crate::engine::DetectionOrchestrator;
use crate::shared::{RuntimeState, ScanEvent};

/// A running scanning session
pub struct ScanSession {
    id: String,
    state: Arc<RwLock<RuntimeState>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScanSession {
    /// Start scanning on the current tokio runtime
    pub fn start(
        orchestrator: Arc<AsyncMutex<DetectionOrchestrator>>,
        source: Box<dyn FrameSource>,
        interval: Duration,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let state = Arc::new(RwLock::new(RuntimeState {
            session_id: id.clone(),
            is_scanning: true,
            ..RuntimeState::default()
        }));
        let cancel = CancellationToken::new();

        info!("Scan session {} starting ({:?} interval)", id, interval);
        let handle = tokio::spawn(run_loop(
            id.clone(),
            orchestrator,
            source,
            interval,
            state.clone(),
            cancel.clone(),
        ));

        Self {
            id,
            state,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the session counters
    pub fn state(&self) -> RuntimeState {
        self.state.read().clone()
    }

    /// Token that stops the session when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the source is exhausted or the session is cancelled
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Scan session {} ended abnormally: {}", self.id, e);
            }
        }
    }

    /// Cancel, let the in-flight cycle finish, and reset tracking
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.wait().await;
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(
    id: String,
    orchestrator: Arc<AsyncMutex<DetectionOrchestrator>>,
    mut source: Box<dyn FrameSource>,
    interval: Duration,
    state: Arc<RwLock<RuntimeState>>,
    cancel: CancellationToken,
) {
    orchestrator.lock().await.broadcast(ScanEvent::Started { session_id: id.clone() });

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Scan session {} cancelled", id);
                break;
            }
            _ = ticker.tick() => {}
        }

        let Ok(guard) = orchestrator.clone().try_lock_owned() else {
            debug!("Previous cycle still running, tick skipped");
            state.write().ticks_skipped += 1;
            continue;
        };

        let (returned, captured) = match capture(source).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Frame source panicked, ending session: {}", e);
                break;
            }
        };
        source = returned;

        let frame = match captured {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Frame source exhausted");
                break;
            }
            Err(e) => {
                warn!("Frame capture failed: {:#}", e);
                let mut state = state.write();
                state.capture_errors += 1;
                state.set_error(format!("{:#}", e));
                continue;
            }
        };

        tokio::spawn(run_cycle(guard, frame, state.clone()));
    }

    let mut orchestrator = orchestrator.lock().await;
    orchestrator.stop();
    orchestrator.broadcast(ScanEvent::Stopped { session_id: id.clone() });

    let mut state = state.write();
    state.is_scanning = false;
    state.confirmed_product = None;
    info!(
        "Scan session {} stopped after {} frames ({} ticks skipped)",
        id, state.frames_processed, state.ticks_skipped
    );
}

/// Pull one frame on the blocking pool, handing the source back
async fn capture(
    mut source: Box<dyn FrameSource>,
) -> Result<(Box<dyn FrameSource>, anyhow::Result<Option<Frame>>), tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        let captured = source.capture_frame();
        (source, captured)
    })
    .await
}

async fn run_cycle(
    mut orchestrator: tokio::sync::OwnedMutexGuard<DetectionOrchestrator>,
    frame: Frame,
    state: Arc<RwLock<RuntimeState>>,
) {
    let (decision, _) = orchestrator.process_frame(Arc::new(frame)).await;
    let confirmed = orchestrator.confirmed_product().map(str::to_string);

    let mut state = state.write();
    state.frames_processed += 1;
    state.last_decision = Some(decision);
    state.confirmed_product = confirmed;
    state.clear_error();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DirectoryFrameSource;
    use crate::engine::test_support::{orchestrator, silent, texture};
    use crate::vision::DetectionMethod;
    use anyhow::Result;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Source that replays one image a fixed number of times
    struct Repeat {
        image: image::RgbaImage,
        remaining: usize,
    }

    impl FrameSource for Repeat {
        fn capture_frame(&mut self) -> Result<Option<Frame>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Frame::from_image(self.image.clone())))
        }
    }

    #[tokio::test]
    async fn test_session_confirms_product_and_stops() {
        let orchestrator = Arc::new(AsyncMutex::new(orchestrator(DetectionMethod::Keypoint, silent())));
        let events = orchestrator.lock().await.subscribe();

        let source = Repeat {
            image: texture(160, 120, 7),
            remaining: 4,
        };
        let mut session = ScanSession::start(orchestrator.clone(), Box::new(source), Duration::from_millis(5));
        session.wait().await;

        let state = session.state();
        assert!(!state.is_scanning);
        assert!(state.frames_processed + state.ticks_skipped >= 4);
        assert!(state.frames_processed >= 3);

        let received: Vec<ScanEvent> = events.try_iter().collect();
        assert_eq!(
            received.first(),
            Some(&ScanEvent::Started {
                session_id: session.id().to_string()
            })
        );
        assert!(received
            .iter()
            .any(|e| matches!(e, ScanEvent::Confirmed { product_id, .. } if product_id == "alpha")));
        assert!(matches!(received.last(), Some(ScanEvent::Stopped { .. })));
        assert!(orchestrator.lock().await.confirmed_product().is_none());
    }

    #[tokio::test]
    async fn test_stop_cancels_looping_source() {
        let dir = tempdir().unwrap();
        texture(64, 48, 3).save(dir.path().join("a.png")).unwrap();
        let source = DirectoryFrameSource::new(dir.path(), true).unwrap();

        let orchestrator = Arc::new(AsyncMutex::new(orchestrator(DetectionMethod::Signature, silent())));
        let mut session = ScanSession::start(orchestrator, Box::new(source), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(60)).await;
        session.stop().await;

        let state = session.state();
        assert!(!state.is_scanning);
        assert!(state.frames_processed > 0);
    }

    /// Source whose single capture blocks, recording whether the runtime kept running
    struct SlowSource {
        ticks: Arc<AtomicUsize>,
        runtime_progressed: Arc<AtomicBool>,
    }

    impl FrameSource for SlowSource {
        fn capture_frame(&mut self) -> Result<Option<Frame>> {
            let before = self.ticks.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            let after = self.ticks.load(Ordering::SeqCst);
            self.runtime_progressed.store(after > before, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_capture_does_not_block_runtime() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let runtime_progressed = Arc::new(AtomicBool::new(false));
        let source = SlowSource {
            ticks,
            runtime_progressed: runtime_progressed.clone(),
        };
        let orchestrator = Arc::new(AsyncMutex::new(orchestrator(DetectionMethod::Signature, silent())));
        let mut session = ScanSession::start(orchestrator, Box::new(source), Duration::from_millis(5));
        session.wait().await;
        ticker.abort();

        assert!(runtime_progressed.load(Ordering::SeqCst));
        assert!(!session.state().is_scanning);
    }

    #[tokio::test]
    async fn test_busy_orchestrator_skips_ticks() {
        let orchestrator = Arc::new(AsyncMutex::new(orchestrator(DetectionMethod::Signature, silent())));
        let source = Repeat {
            image: texture(64, 48, 3),
            remaining: 10_000,
        };
        let mut session = ScanSession::start(orchestrator.clone(), Box::new(source), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let held = orchestrator.clone().lock_owned().await;
        let before = session.state();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let during = session.state();
        assert!(during.ticks_skipped > before.ticks_skipped);
        assert_eq!(during.frames_processed, before.frames_processed);

        drop(held);
        session.stop().await;
    }
}
