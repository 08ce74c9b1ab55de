use crate::events::{AlertEvent, EventBus, FrameEvent};
use crate::orchestrator::AlertOrchestrator;
use crate::settings::{Settings, SettingsHandle};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use warden_core::{CatalogError, FaceMatcher, PresenceTracker, SignatureCatalog};
use warden_hw::{open_with_fallback, CameraError, CameraOpener, CaptureSource};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("signature catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error("no face signatures enrolled")]
    NoSignatures,
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("previous detection loop is still shutting down")]
    StillStopping,
    #[error("failed to spawn detection thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Result of a successful [`DetectionLoop::start`].
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub already_running: bool,
    pub camera_device: Option<u32>,
    pub signatures_loaded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: LoopState,
    pub camera_device: Option<u32>,
    pub signatures_loaded: usize,
    pub consecutive_non_owner: u32,
    pub frames_seen: u64,
    pub alerts_fired: u64,
    pub last_owner_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    /// Sleep after each frame.
    pub throttle: Duration,
    /// Sleep after a failed read.
    pub idle_sleep: Duration,
    /// Upper bound on how long `stop` waits.
    pub stop_timeout: Duration,
}

/// Everything the loop needs besides the matcher.
pub struct EngineParts {
    pub catalog: Arc<SignatureCatalog>,
    pub settings: Arc<SettingsHandle>,
    pub opener: Arc<dyn CameraOpener>,
    pub orchestrator: Arc<AlertOrchestrator>,
    pub events: EventBus,
    pub timing: LoopTiming,
}

/// State shared between the controller, the worker and status readers.
struct Shared {
    running: AtomicBool,
    state: Mutex<LoopState>,
    camera_device: Mutex<Option<u32>>,
    consecutive_non_owner: AtomicU32,
    frames_seen: AtomicU64,
    alerts_fired: AtomicU64,
    last_owner_seen_at: Mutex<Option<DateTime<Utc>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            state: Mutex::new(LoopState::Stopped),
            camera_device: Mutex::new(None),
            consecutive_non_owner: AtomicU32::new(0),
            frames_seen: AtomicU64::new(0),
            alerts_fired: AtomicU64::new(0),
            last_owner_seen_at: Mutex::new(None),
        }
    }

    fn state(&self) -> LoopState {
        *lock(&self.state)
    }

    fn set_state(&self, state: LoopState) {
        *lock(&self.state) = state;
    }
}

/// Cheap, clonable reader of loop status. Never blocks on start/stop.
#[derive(Clone)]
pub struct StatusHandle {
    shared: Arc<Shared>,
    catalog: Arc<SignatureCatalog>,
}

impl StatusHandle {
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.shared.state(),
            camera_device: *lock(&self.shared.camera_device),
            signatures_loaded: self.catalog.len(),
            consecutive_non_owner: self.shared.consecutive_non_owner.load(Ordering::Relaxed),
            frames_seen: self.shared.frames_seen.load(Ordering::Relaxed),
            alerts_fired: self.shared.alerts_fired.load(Ordering::Relaxed),
            last_owner_seen_at: *lock(&self.shared.last_owner_seen_at),
        }
    }
}

struct WorkerHandle {
    handle: JoinHandle<()>,
    done_rx: std_mpsc::Receiver<()>,
}

/// Owns the detection thread's lifecycle.
///
/// At most one worker runs at a time. The camera is opened by `start`,
/// handed to the worker, and released by the worker when it exits.
pub struct DetectionLoop {
    parts: EngineParts,
    matcher: Arc<Mutex<FaceMatcher>>,
    shared: Arc<Shared>,
    worker: Option<WorkerHandle>,
}

impl DetectionLoop {
    pub fn new(parts: EngineParts, matcher: FaceMatcher) -> Self {
        Self {
            parts,
            matcher: Arc::new(Mutex::new(matcher)),
            shared: Arc::new(Shared::new()),
            worker: None,
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            shared: self.shared.clone(),
            catalog: self.parts.catalog.clone(),
        }
    }

    /// Reload settings and catalog, open the camera, and spawn the worker.
    ///
    /// A no-op returning `already_running` if the loop is already up.
    pub fn start(&mut self) -> Result<StartReport, EngineError> {
        if matches!(self.shared.state(), LoopState::Running | LoopState::Starting) {
            return Ok(StartReport {
                already_running: true,
                camera_device: *lock(&self.shared.camera_device),
                signatures_loaded: self.parts.catalog.len(),
            });
        }
        self.reap_worker()?;

        self.shared.set_state(LoopState::Starting);
        let result = self.launch();
        if result.is_err() {
            self.shared.set_state(LoopState::Stopped);
        }
        result
    }

    fn launch(&mut self) -> Result<StartReport, EngineError> {
        let settings = self.parts.settings.reload();
        let signatures_loaded = self.parts.catalog.reload()?;
        if signatures_loaded == 0 {
            return Err(EngineError::NoSignatures);
        }

        let camera = open_with_fallback(self.parts.opener.as_ref(), settings.camera_index)?;
        let device = camera.device_index();

        self.shared.consecutive_non_owner.store(0, Ordering::Relaxed);
        self.shared.frames_seen.store(0, Ordering::Relaxed);
        self.shared.running.store(true, Ordering::SeqCst);

        let worker = DetectWorker {
            camera,
            matcher: self.matcher.clone(),
            catalog: self.parts.catalog.clone(),
            settings: self.parts.settings.clone(),
            orchestrator: self.parts.orchestrator.clone(),
            events: self.parts.events.clone(),
            shared: self.shared.clone(),
            timing: self.parts.timing,
        };
        let (done_tx, done_rx) = std_mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("warden-detect".into())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            });
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(EngineError::Spawn(e));
            }
        };

        self.worker = Some(WorkerHandle { handle, done_rx });
        *lock(&self.shared.camera_device) = Some(device);
        self.shared.set_state(LoopState::Running);

        tracing::info!(
            camera = device,
            signatures = signatures_loaded,
            threshold = settings.alert_threshold,
            frame_skip = settings.frame_skip,
            "detection loop started"
        );
        Ok(StartReport {
            already_running: false,
            camera_device: Some(device),
            signatures_loaded,
        })
    }

    /// Join a worker left over from a stop that timed out.
    ///
    /// The worker marks the loop `Stopped` as its last act, so a `Stopped`
    /// state with a handle still present means only the thread teardown is left.
    fn reap_worker(&mut self) -> Result<(), EngineError> {
        let exited = self.shared.state() == LoopState::Stopped;
        match self.worker.take() {
            None => Ok(()),
            Some(w) if exited || w.handle.is_finished() => {
                if w.handle.join().is_err() {
                    tracing::warn!("previous detection thread panicked");
                }
                Ok(())
            }
            Some(w) => {
                self.worker = Some(w);
                Err(EngineError::StillStopping)
            }
        }
    }

    /// Signal the worker to exit and wait, up to the stop timeout.
    ///
    /// Returns false if nothing was running. Safe to call repeatedly. If the
    /// worker is still finishing an alert when the timeout expires, the loop
    /// stays `Stopping` until the worker exits on its own.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            self.shared.set_state(LoopState::Stopped);
            return false;
        };

        self.shared.set_state(LoopState::Stopping);
        self.shared.running.store(false, Ordering::SeqCst);

        match worker.done_rx.recv_timeout(self.parts.timing.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    tracing::warn!("detection thread panicked");
                }
                tracing::info!("detection loop stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = self.parts.timing.stop_timeout.as_millis() as u64,
                    "detection loop did not stop in time; it will exit after the current frame"
                );
                self.worker = Some(worker);
                return true;
            }
        }

        *lock(&self.shared.camera_device) = None;
        self.shared.set_state(LoopState::Stopped);
        true
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs on the `warden-detect` thread.
struct DetectWorker {
    camera: Box<dyn CaptureSource>,
    matcher: Arc<Mutex<FaceMatcher>>,
    catalog: Arc<SignatureCatalog>,
    settings: Arc<SettingsHandle>,
    orchestrator: Arc<AlertOrchestrator>,
    events: EventBus,
    shared: Arc<Shared>,
    timing: LoopTiming,
}

impl DetectWorker {
    fn run(mut self) {
        tracing::debug!("detection thread started");
        let matcher = self.matcher.clone();
        let mut matcher = lock(&matcher);
        let mut presence = PresenceTracker::new();
        let mut frame_number: u64 = 0;

        while self.shared.running.load(Ordering::SeqCst) {
            let Some(frame) = self.camera.read_frame() else {
                std::thread::sleep(self.timing.idle_sleep);
                continue;
            };
            frame_number += 1;
            self.shared.frames_seen.store(frame_number, Ordering::Relaxed);

            let settings = self.settings.current();
            if frame_number % u64::from(settings.frame_skip.max(1)) == 0 {
                let processed = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.process(&mut matcher, &mut presence, &frame, frame_number, &settings)
                }));
                if processed.is_err() {
                    tracing::error!(frame = frame_number, "frame processing panicked; continuing");
                }
            }

            if !self.timing.throttle.is_zero() {
                std::thread::sleep(self.timing.throttle);
            }
        }

        self.camera.close();
        *lock(&self.shared.camera_device) = None;
        self.shared.set_state(LoopState::Stopped);
        tracing::debug!(frames = frame_number, "detection thread exiting");
    }

    fn process(
        &self,
        matcher: &mut FaceMatcher,
        presence: &mut PresenceTracker,
        frame: &RgbImage,
        frame_number: u64,
        settings: &Settings,
    ) {
        matcher.set_scale(settings.frame_scale);
        let catalog = self.catalog.snapshot();
        let started = std::time::Instant::now();
        let (annotated, detections) = match matcher.process(frame, &catalog, settings.tolerance) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(frame = frame_number, error = %e, "frame analysis failed");
                return;
            }
        };
        tracing::trace!(
            frame = frame_number,
            faces = detections.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "frame processed"
        );

        // Subscribers see the frame before any alert it causes.
        if self.events.has_frame_subscribers() {
            if let Some(event) = FrameEvent::encode(&annotated, detections.clone(), frame_number) {
                self.events.publish_frame(event);
            }
        }

        presence.update(&detections);
        self.shared
            .consecutive_non_owner
            .store(presence.count(), Ordering::Relaxed);
        if let Some(seen) = presence.last_owner_seen_at() {
            *lock(&self.shared.last_owner_seen_at) = Some(seen);
        }

        if !detections.is_empty() && presence.should_trigger(settings.alert_threshold) {
            let outcome = self.orchestrator.trigger(&detections, Some(frame), settings);
            self.events.publish_alert(AlertEvent::from(&outcome));
            presence.reset();
            self.shared.consecutive_non_owner.store(0, Ordering::Relaxed);
            self.shared.alerts_fired.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{orchestrator_with_grace, Harness};
    use crate::settings::{KEY_CAMERA_INDEX, KEY_FRAME_SCALE, KEY_FRAME_SKIP, KEY_UNKNOWN_THRESHOLD};
    use crate::store::Store;
    use std::collections::VecDeque;
    use std::time::Instant;
    use warden_core::{AnalyzerError, FaceAnalyzer, FaceRegion, Signature};

    const OWNER: [u8; 3] = [255, 255, 255];
    const STRANGER: [u8; 3] = [0, 0, 0];

    /// One face covering the whole frame; its signature is the red channel.
    struct PixelAnalyzer {
        panic_first: bool,
    }

    impl FaceAnalyzer for PixelAnalyzer {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, AnalyzerError> {
            if std::mem::take(&mut self.panic_first) {
                panic!("analyzer blew up");
            }
            Ok(vec![FaceRegion {
                x: 0.0,
                y: 0.0,
                width: image.width() as f32,
                height: image.height() as f32,
                score: 0.9,
            }])
        }

        fn signature(&mut self, image: &RgbImage, _region: &FaceRegion) -> Result<Signature, AnalyzerError> {
            let r = image.get_pixel(0, 0).0[0] as f32 / 255.0;
            Ok(Signature::new(vec![r, 0.0]))
        }
    }

    /// Serves a fixed script of frames, then nothing.
    struct ScriptedCamera {
        frames: VecDeque<RgbImage>,
        index: u32,
        open: bool,
    }

    impl CaptureSource for ScriptedCamera {
        fn read_frame(&mut self) -> Option<RgbImage> {
            self.frames.pop_front()
        }
        fn close(&mut self) {
            self.open = false;
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn device_index(&self) -> u32 {
            self.index
        }
    }

    struct ScriptedOpener {
        working: Vec<u32>,
        script: Vec<[u8; 3]>,
    }

    impl CameraOpener for ScriptedOpener {
        fn open(&self, index: u32) -> Result<Box<dyn CaptureSource>, CameraError> {
            if !self.working.contains(&index) {
                return Err(CameraError::DeviceNotFound(format!("/dev/video{index}")));
            }
            let frames = self
                .script
                .iter()
                .map(|px| RgbImage::from_pixel(8, 6, image::Rgb(*px)))
                .collect();
            Ok(Box::new(ScriptedCamera { frames, index, open: true }))
        }
    }

    struct Fixture {
        engine: DetectionLoop,
        events: EventBus,
        harness: Harness,
    }

    fn fixture(store: Arc<Store>, opener: ScriptedOpener, panic_first: bool) -> Fixture {
        fixture_with_timing(store, opener, panic_first, Duration::ZERO, Duration::from_secs(2))
    }

    fn fixture_with_timing(
        store: Arc<Store>,
        opener: ScriptedOpener,
        panic_first: bool,
        grace: Duration,
        stop_timeout: Duration,
    ) -> Fixture {
        let (orch, harness) = orchestrator_with_grace(false, false, grace);
        let events = EventBus::new(16);
        let parts = EngineParts {
            catalog: Arc::new(SignatureCatalog::new(store.clone())),
            settings: Arc::new(SettingsHandle::new(store)),
            opener: Arc::new(opener),
            orchestrator: Arc::new(orch),
            events: events.clone(),
            timing: LoopTiming {
                throttle: Duration::ZERO,
                idle_sleep: Duration::from_millis(5),
                stop_timeout,
            },
        };
        let matcher = FaceMatcher::new(Box::new(PixelAnalyzer { panic_first }), 1.0);
        Fixture { engine: DetectionLoop::new(parts, matcher), events, harness }
    }

    fn enrolled_store() -> Arc<Store> {
        let store = Store::open_in_memory().unwrap();
        let alice = store.insert_user("alice", true, false, None);
        store.add_signature(alice, &Signature::new(vec![1.0, 0.0]));
        store.set_setting(KEY_FRAME_SKIP, "1").unwrap();
        store.set_setting(KEY_FRAME_SCALE, "1.0").unwrap();
        store.set_setting(KEY_UNKNOWN_THRESHOLD, "3").unwrap();
        Arc::new(store)
    }

    fn wait_until(engine: &DetectionLoop, pred: impl Fn(&EngineStatus) -> bool) -> EngineStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = engine.status_handle().status();
            if pred(&status) {
                return status;
            }
            assert!(Instant::now() < deadline, "timed out; last status {status:?}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_three_strangers_fire_exactly_one_alert() {
        let opener = ScriptedOpener { working: vec![0], script: vec![STRANGER; 3] };
        let mut f = fixture(enrolled_store(), opener, false);
        let mut frames = f.events.subscribe_frames();
        let mut alerts = f.events.subscribe_alerts();

        let report = f.engine.start().unwrap();
        assert_eq!(report.signatures_loaded, 1);
        assert_eq!(report.camera_device, Some(0));

        let status = wait_until(&f.engine, |s| s.frames_seen == 3 && s.alerts_fired == 1);
        assert_eq!(status.consecutive_non_owner, 0);
        assert_eq!(status.state, LoopState::Running);

        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.intruder_name, "Unknown");
        assert!(alert.locked);
        assert!(alerts.try_recv().is_err());

        for n in 1..=3 {
            let event = frames.try_recv().unwrap();
            assert_eq!(event.frame_number, n);
            assert_eq!(event.detections.len(), 1);
            assert!(!event.detections[0].is_owner);
        }

        assert!(f.engine.stop());
        assert_eq!(f.engine.status_handle().status().state, LoopState::Stopped);
    }

    #[test]
    fn test_owner_in_frame_resets_counter() {
        let script = vec![STRANGER, STRANGER, OWNER, STRANGER, STRANGER];
        let opener = ScriptedOpener { working: vec![0], script };
        let mut f = fixture(enrolled_store(), opener, false);
        f.engine.start().unwrap();

        let status = wait_until(&f.engine, |s| s.frames_seen == 5 && s.consecutive_non_owner == 2);
        assert_eq!(status.alerts_fired, 0);
        assert!(status.last_owner_seen_at.is_some());
        f.engine.stop();
    }

    #[test]
    fn test_frame_skip_processes_every_nth() {
        let store = enrolled_store();
        store.set_setting(KEY_FRAME_SKIP, "2").unwrap();
        let opener = ScriptedOpener { working: vec![0], script: vec![STRANGER; 6] };
        let mut f = fixture(store, opener, false);
        let mut frames = f.events.subscribe_frames();
        f.engine.start().unwrap();

        let status = wait_until(&f.engine, |s| s.frames_seen == 6 && s.alerts_fired == 1);
        assert_eq!(status.consecutive_non_owner, 0);
        let numbers: Vec<u64> = std::iter::from_fn(|| frames.try_recv().ok())
            .map(|e| e.frame_number)
            .collect();
        assert_eq!(numbers, vec![2, 4, 6]);
        f.engine.stop();
    }

    #[test]
    fn test_panicking_frame_does_not_kill_loop() {
        let opener = ScriptedOpener { working: vec![0], script: vec![STRANGER; 4] };
        let mut f = fixture(enrolled_store(), opener, true);
        f.engine.start().unwrap();

        let status = wait_until(&f.engine, |s| s.frames_seen == 4 && s.alerts_fired == 1);
        assert_eq!(status.state, LoopState::Running);
        f.engine.stop();
    }

    #[test]
    fn test_start_rejects_empty_catalog() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let opener = ScriptedOpener { working: vec![0], script: Vec::new() };
        let mut f = fixture(store, opener, false);
        assert!(matches!(f.engine.start(), Err(EngineError::NoSignatures)));
        assert_eq!(f.engine.status_handle().status().state, LoopState::Stopped);
    }

    #[test]
    fn test_start_falls_back_to_camera_zero() {
        let store = enrolled_store();
        store.set_setting(KEY_CAMERA_INDEX, "2").unwrap();
        let opener = ScriptedOpener { working: vec![0], script: Vec::new() };
        let mut f = fixture(store, opener, false);
        let report = f.engine.start().unwrap();
        assert_eq!(report.camera_device, Some(0));
        assert_eq!(f.engine.status_handle().status().camera_device, Some(0));
        f.engine.stop();
    }

    #[test]
    fn test_start_without_camera_fails() {
        let store = enrolled_store();
        store.set_setting(KEY_CAMERA_INDEX, "2").unwrap();
        let opener = ScriptedOpener { working: Vec::new(), script: Vec::new() };
        let mut f = fixture(store, opener, false);
        assert!(matches!(f.engine.start(), Err(EngineError::CameraUnavailable(_))));
        assert_eq!(f.engine.status_handle().status().state, LoopState::Stopped);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let opener = ScriptedOpener { working: vec![0], script: Vec::new() };
        let mut f = fixture(enrolled_store(), opener, false);
        assert!(!f.engine.stop());

        assert!(!f.engine.start().unwrap().already_running);
        assert!(f.engine.start().unwrap().already_running);

        assert!(f.engine.stop());
        assert!(!f.engine.stop());
        assert_eq!(f.engine.status_handle().status().camera_device, None);

        // Restart after a clean stop.
        assert!(!f.engine.start().unwrap().already_running);
        f.engine.stop();
    }

    #[test]
    fn test_stop_during_alert_stays_stopping_until_lock_completes() {
        let store = enrolled_store();
        let opener = ScriptedOpener { working: vec![0], script: vec![STRANGER; 3] };
        let mut f = fixture_with_timing(
            store.clone(),
            opener,
            false,
            Duration::from_millis(600),
            Duration::from_millis(50),
        );
        f.engine.start().unwrap();

        // Wait until the alert is inside its grace period.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f.harness.journal.lock().unwrap().contains(&"audit".to_string()) {
            assert!(Instant::now() < deadline, "alert never started");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(f.engine.stop());
        let status = f.engine.status_handle().status();
        assert_eq!(status.state, LoopState::Stopping);
        assert_eq!(status.camera_device, Some(0));
        assert!(matches!(f.engine.start(), Err(EngineError::StillStopping)));
        assert!(!f.harness.journal.lock().unwrap().contains(&"lock".to_string()));

        let status = wait_until(&f.engine, |s| s.state == LoopState::Stopped);
        assert_eq!(status.camera_device, None);
        assert_eq!(status.alerts_fired, 1);
        assert!(f.harness.journal.lock().unwrap().contains(&"lock".to_string()));

        // The finished worker is reaped and a fresh start goes through.
        store.set_setting(KEY_UNKNOWN_THRESHOLD, "10").unwrap();
        assert!(!f.engine.start().unwrap().already_running);
        f.engine.stop();
    }
}
