//! InferenceGate - serialized access to the camera rig and detector
//!
//! ## Responsibilities
//!
//! - Single owner of the physical sensor: every frame grab goes through
//!   the rig lock, with a bounded wait and an explicit Busy outcome
//! - Model lifecycle (enable with fallback to the configured default,
//!   disable) reflected into the AI facet of the device state
//! - Threshold filter, coordinate clamp and detection cap on every run
//!
//! Inference runs hold the rig for their full duration, so the streaming
//! tick sees Busy and skips frames instead of queueing behind the run.

mod camera;
mod engine;

pub use camera::{FrameSource, V4l2Camera};
pub use engine::{DetectionEngine, HttpEngine, RawDetection};

use crate::device_state::{AiState, Detection, DeviceStateStore};
use crate::error::{Error, Result};
use crate::settings_vault::SettingsVault;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Rig wait for an inference run (milliseconds)
const RUN_WAIT_MS: u64 = 600;

/// Rig wait for a streaming frame grab (milliseconds)
const FRAME_WAIT_MS: u64 = 5;

/// Detections kept per run after thresholding
const MAX_DETECTIONS: usize = 25;

/// Outcome of an inference run
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Detections(Vec<Detection>),
    /// Rig held by another caller within the wait window
    Busy,
}

/// Outcome of a frame grab
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Frame(Vec<u8>),
    Busy,
}

/// InferenceGate - rig lock, detector and AI facet owner
pub struct InferenceGate {
    camera: Arc<dyn FrameSource>,
    engine: Arc<dyn DetectionEngine>,
    /// Serializes sensor access across inference, streaming and photos
    rig: Arc<Mutex<()>>,
    run_wait: Duration,
    frame_wait: Duration,
    store: Arc<DeviceStateStore>,
    vault: Arc<SettingsVault>,
}

impl InferenceGate {
    pub fn new(
        camera: Arc<dyn FrameSource>,
        engine: Arc<dyn DetectionEngine>,
        store: Arc<DeviceStateStore>,
        vault: Arc<SettingsVault>,
    ) -> Self {
        Self::with_waits(camera, engine, store, vault, RUN_WAIT_MS, FRAME_WAIT_MS)
    }

    /// Create with explicit rig waits
    pub fn with_waits(
        camera: Arc<dyn FrameSource>,
        engine: Arc<dyn DetectionEngine>,
        store: Arc<DeviceStateStore>,
        vault: Arc<SettingsVault>,
        run_wait_ms: u64,
        frame_wait_ms: u64,
    ) -> Self {
        Self {
            camera,
            engine,
            rig: Arc::new(Mutex::new(())),
            run_wait: Duration::from_millis(run_wait_ms),
            frame_wait: Duration::from_millis(frame_wait_ms),
            store,
            vault,
        }
    }

    /// Probe the sensor and record the result in the state
    pub async fn probe_camera(&self) -> bool {
        let ready = self.camera.probe().await;
        self.store.mutate(|s| s.camera_ready = ready).await;
        if !ready {
            tracing::warn!("Camera probe failed, captures will error until it returns");
        }
        ready
    }

    /// Detection engine reachable
    pub async fn engine_online(&self) -> bool {
        self.engine.health().await
    }

    /// Load a model and mark AI enabled
    ///
    /// A requested model that fails to load falls back to the configured
    /// default; if that fails too the gate stays disabled and the error
    /// propagates.
    pub async fn enable(&self, requested: Option<String>) -> Result<AiState> {
        let default_ref = self.vault.snapshot().await.ai_model_ref;

        let loaded = match requested {
            Some(wanted) if wanted != default_ref => {
                match self.engine.load(&wanted).await {
                    Ok(()) => wanted,
                    Err(e) => {
                        tracing::warn!(
                            model = %wanted,
                            error = %e,
                            "Model load failed, falling back to configured default"
                        );
                        self.engine.load(&default_ref).await?;
                        default_ref
                    }
                }
            }
            _ => {
                self.engine.load(&default_ref).await?;
                default_ref
            }
        };

        let state = self
            .store
            .mutate(|s| {
                s.ai.enabled = true;
                s.ai.ready = true;
                s.ai.model_ref = loaded.clone();
            })
            .await;

        tracing::info!(model = %state.ai.model_ref, "AI enabled");
        Ok(state.ai)
    }

    /// Unload the model and clear the AI facet. Unload errors are
    /// logged and swallowed.
    pub async fn disable(&self) -> AiState {
        if let Err(e) = self.engine.unload().await {
            tracing::debug!(error = %e, "Model unload reported an error");
        }

        let state = self
            .store
            .mutate(|s| {
                s.ai.enabled = false;
                s.ai.ready = false;
                s.ai.detections.clear();
            })
            .await;

        tracing::info!("AI disabled");
        state.ai
    }

    /// Run one inference pass: grab a frame under the rig lock, detect,
    /// threshold, clamp and cap, then record the results.
    pub async fn run(&self) -> Result<RunOutcome> {
        if !self.store.read().await.ai.enabled {
            return Err(Error::Validation("AI is not enabled".to_string()));
        }

        let _guard = match timeout(self.run_wait, self.rig.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(
                    wait_ms = self.run_wait.as_millis(),
                    "Camera rig busy, inference skipped"
                );
                return Ok(RunOutcome::Busy);
            }
        };

        let frame = self.camera.capture_jpeg().await?;
        let raw = self.engine.detect(frame).await?;
        let total = raw.len();

        let threshold = self.vault.snapshot().await.ai_threshold;
        let detections: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.score >= threshold)
            .take(MAX_DETECTIONS)
            .map(|d| {
                Detection {
                    label: d.label,
                    score: d.score,
                    x: d.x,
                    y: d.y,
                    w: d.w,
                    h: d.h,
                }
                .clamped()
            })
            .collect();

        let now_ms = chrono::Utc::now().timestamp_millis();
        self.store
            .mutate(|s| {
                s.ai.last_run_ms = Some(now_ms);
                s.ai.detections = detections.clone();
            })
            .await;

        tracing::debug!(
            raw = total,
            kept = detections.len(),
            threshold = threshold,
            "Inference run complete"
        );
        Ok(RunOutcome::Detections(detections))
    }

    /// Grab a frame for the stream fan-out. The short wait makes this a
    /// try-acquire: while inference holds the rig the tick drops frames.
    pub async fn capture_frame(&self) -> Result<FrameOutcome> {
        self.grab(self.frame_wait).await
    }

    /// Grab a frame for a photo, waiting as long as an inference run would
    pub async fn capture_photo(&self) -> Result<FrameOutcome> {
        self.grab(self.run_wait).await
    }

    async fn grab(&self, wait: Duration) -> Result<FrameOutcome> {
        let _guard = match timeout(wait, self.rig.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => return Ok(FrameOutcome::Busy),
        };

        let frame = self.camera.capture_jpeg().await?;
        Ok(FrameOutcome::Frame(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings_vault::{SettingsRepository, DEFAULT_MODEL_REF};

    struct StubCamera {
        delay_ms: u64,
    }

    #[async_trait::async_trait]
    impl FrameSource for StubCamera {
        async fn capture_jpeg(&self) -> Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(vec![0xFF, 0xD8, 0xFF, 0xD9])
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    struct StubEngine {
        accept: Vec<String>,
        detections: Vec<RawDetection>,
    }

    #[async_trait::async_trait]
    impl DetectionEngine for StubEngine {
        async fn load(&self, model_ref: &str) -> Result<()> {
            if self.accept.iter().any(|m| m == model_ref) {
                Ok(())
            } else {
                Err(Error::Inference(format!("no such model: {}", model_ref)))
            }
        }

        async fn unload(&self) -> Result<()> {
            Ok(())
        }

        async fn detect(&self, _jpeg: Vec<u8>) -> Result<Vec<RawDetection>> {
            Ok(self.detections.clone())
        }

        async fn health(&self) -> bool {
            true
        }
    }

    fn raw(score: f32, x: f32) -> RawDetection {
        RawDetection {
            label: "strawberry".to_string(),
            score,
            x,
            y: 0.2,
            w: 0.1,
            h: 0.1,
        }
    }

    async fn gate_with(
        camera_delay_ms: u64,
        engine: StubEngine,
        run_wait_ms: u64,
    ) -> (tempfile::TempDir, InferenceGate) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SettingsRepository::new(dir.path().to_path_buf());
        let vault = Arc::new(SettingsVault::new(repo).await.unwrap());
        let store = Arc::new(DeviceStateStore::default());
        let gate = InferenceGate::with_waits(
            Arc::new(StubCamera {
                delay_ms: camera_delay_ms,
            }),
            Arc::new(engine),
            store,
            vault,
            run_wait_ms,
            1,
        );
        (dir, gate)
    }

    #[tokio::test]
    async fn test_run_requires_enabled() {
        let engine = StubEngine {
            accept: vec![DEFAULT_MODEL_REF.to_string()],
            detections: vec![],
        };
        let (_dir, gate) = gate_with(0, engine, 600).await;

        let result = gate.run().await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_run_filters_clamps_and_caps() {
        let mut detections = vec![raw(0.4, 0.5), raw(0.9, 1.7)];
        for _ in 0..30 {
            detections.push(raw(0.8, 0.3));
        }
        let engine = StubEngine {
            accept: vec![DEFAULT_MODEL_REF.to_string()],
            detections,
        };
        let (_dir, gate) = gate_with(0, engine, 600).await;

        gate.enable(None).await.unwrap();
        let outcome = gate.run().await.unwrap();

        let kept = match outcome {
            RunOutcome::Detections(d) => d,
            RunOutcome::Busy => panic!("unexpected busy"),
        };
        // 0.4 dropped by the 0.5 threshold, the rest capped at 25
        assert_eq!(kept.len(), MAX_DETECTIONS);
        assert!(kept.iter().all(|d| d.score >= 0.5));
        assert!(kept.iter().all(|d| d.x <= 1.0));
    }

    #[tokio::test]
    async fn test_concurrent_run_reports_busy() {
        let engine = StubEngine {
            accept: vec![DEFAULT_MODEL_REF.to_string()],
            detections: vec![raw(0.9, 0.1)],
        };
        let (_dir, gate) = gate_with(200, engine, 50).await;
        gate.enable(None).await.unwrap();

        let gate = Arc::new(gate);
        let first = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Second run exhausts its 50ms wait while the first holds the rig
        let second = gate.run().await.unwrap();
        assert_eq!(second, RunOutcome::Busy);

        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, RunOutcome::Detections(_)));
    }

    #[tokio::test]
    async fn test_frame_grab_busy_during_run() {
        let engine = StubEngine {
            accept: vec![DEFAULT_MODEL_REF.to_string()],
            detections: vec![],
        };
        let (_dir, gate) = gate_with(200, engine, 600).await;
        gate.enable(None).await.unwrap();

        let gate = Arc::new(gate);
        let run = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frame = gate.capture_frame().await.unwrap();
        assert_eq!(frame, FrameOutcome::Busy);

        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_enable_falls_back_to_default_model() {
        let engine = StubEngine {
            accept: vec![DEFAULT_MODEL_REF.to_string()],
            detections: vec![],
        };
        let (_dir, gate) = gate_with(0, engine, 600).await;

        let ai = gate.enable(Some("models/does-not-exist".to_string())).await.unwrap();
        assert!(ai.enabled);
        assert_eq!(ai.model_ref, DEFAULT_MODEL_REF);
    }

    #[tokio::test]
    async fn test_enable_fails_when_default_rejected() {
        let engine = StubEngine {
            accept: vec![],
            detections: vec![],
        };
        let (_dir, gate) = gate_with(0, engine, 600).await;

        assert!(gate.enable(None).await.is_err());
        assert!(gate.enable(Some("models/other".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn test_disable_clears_detections() {
        let engine = StubEngine {
            accept: vec![DEFAULT_MODEL_REF.to_string()],
            detections: vec![raw(0.9, 0.1)],
        };
        let (_dir, gate) = gate_with(0, engine, 600).await;

        gate.enable(None).await.unwrap();
        gate.run().await.unwrap();

        let ai = gate.disable().await;
        assert!(!ai.enabled);
        assert!(ai.detections.is_empty());
    }
}
