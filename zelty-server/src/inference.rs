//! Inference engine: backend abstraction, preprocessing, YOLO
//! postprocessing, model lifecycle and the simulation fallback.
//!
//! The detection model itself is an external collaborator. Backends are
//! registered in a factory table at startup; when no backend accepts the
//! configured model file (or the file is absent) the engine runs in
//! simulation mode and emits synthetic detections so the rest of the
//! pipeline stays exercisable.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use zelty_tracking::non_max_suppression;
use zelty_types::{now_ms, BoundingBox, Detection, GameState};

use crate::scheduler::InferenceRequest;

#[derive(thiserror::Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("model load failed: {0}")]
    ModelLoadFailed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Planar CHW input tensor. Borrows the caller's scratch buffer, so a
/// payload that already lives in process memory is passed through without
/// copies beyond the resize itself.
pub struct InputTensor<'a> {
    pub data: &'a [f32],
    pub width: u16,
    pub height: u16,
}

/// Raw model output, YOLO family: `[1, 4+C, N]` attribute-major.
pub struct OutputTensor {
    pub data: Vec<f32>,
    pub classes: usize,
    pub candidates: usize,
}

impl OutputTensor {
    #[inline]
    fn at(&self, attr: usize, candidate: usize) -> f32 {
        self.data[attr * self.candidates + candidate]
    }
}

/// A loaded model instance.
pub trait ModelSession: Send + Sync {
    fn run(&self, input: &InputTensor<'_>) -> Result<OutputTensor, InferenceError>;
}

/// Creates sessions from model files. Implementations wrap whatever
/// runtime actually executes the network.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, path: &Path) -> bool;
    fn load(&self, path: &Path) -> Result<Box<dyn ModelSession>, InferenceError>;
}

/// Factory table of model backends, built once at startup.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Box<dyn ModelBackend>) {
        info!("registered model backend \"{}\"", backend.name());
        self.backends.push(backend);
    }

    fn backend_for(&self, path: &Path) -> Option<&dyn ModelBackend> {
        self.backends
            .iter()
            .find(|b| b.supports(path))
            .map(|b| b.as_ref())
    }
}

/// Identity of the currently loaded model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMeta {
    pub path: PathBuf,
    pub hash: String,
    pub loaded_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub model_width: u16,
    pub model_height: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolo_nano_cs16.onnx"),
            confidence_threshold: 0.5,
            nms_threshold: 0.45,
            model_width: 416,
            model_height: 416,
        }
    }
}

enum EngineMode {
    Simulation,
    Loaded(Box<dyn ModelSession>),
}

/// Ring of the last 100 per-frame latencies, ms.
#[derive(Debug, Default)]
pub struct LatencyRing {
    samples: Vec<f64>,
    next: usize,
}

const LATENCY_RING_CAPACITY: usize = 100;

impl LatencyRing {
    pub fn push(&mut self, latency_ms: f64) {
        if self.samples.len() < LATENCY_RING_CAPACITY {
            self.samples.push(latency_ms);
        } else {
            self.samples[self.next] = latency_ms;
        }
        self.next = (self.next + 1) % LATENCY_RING_CAPACITY;
    }

    pub fn mean_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn p99_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64 * 0.99).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)]
    }
}

/// The inference engine. The session is guarded by one exclusive lock
/// held across `run`; preprocessing and postprocessing happen outside it.
pub struct InferenceEngine {
    config: EngineConfig,
    registry: BackendRegistry,
    session: tokio::sync::Mutex<EngineMode>,
    meta: Mutex<Option<ModelMeta>>,
    inference_count: AtomicU64,
    inference_errors: AtomicU64,
    latency: Mutex<LatencyRing>,
}

impl InferenceEngine {
    /// Build the engine, entering simulation mode if the model cannot be
    /// loaded.
    pub fn new(config: EngineConfig, registry: BackendRegistry) -> Arc<Self> {
        let (mode, meta) = match load_model(&config, &registry) {
            Ok((meta, session)) => {
                info!(
                    "loaded model {} (sha256 {})",
                    meta.path.display(),
                    &meta.hash[..12.min(meta.hash.len())]
                );
                (EngineMode::Loaded(session), Some(meta))
            }
            Err(err) => {
                warn!("{err}; running in simulation mode");
                (EngineMode::Simulation, None)
            }
        };
        Arc::new(Self {
            config,
            registry,
            session: tokio::sync::Mutex::new(mode),
            meta: Mutex::new(meta),
            inference_count: AtomicU64::new(0),
            inference_errors: AtomicU64::new(0),
            latency: Mutex::new(LatencyRing::default()),
        })
    }

    pub fn is_simulation(&self) -> bool {
        self.meta.lock().is_none()
    }

    pub fn model_meta(&self) -> Option<ModelMeta> {
        self.meta.lock().clone()
    }

    pub fn inference_count(&self) -> u64 {
        self.inference_count.load(Ordering::Relaxed)
    }

    pub fn inference_errors(&self) -> u64 {
        self.inference_errors.load(Ordering::Relaxed)
    }

    pub fn latency_mean_ms(&self) -> f64 {
        self.latency.lock().mean_ms()
    }

    pub fn latency_p99_ms(&self) -> f64 {
        self.latency.lock().p99_ms()
    }

    /// Rehash the model file; when the content changed (or a file appeared
    /// while simulating), swap the session. In-flight inferences finish on
    /// the old session because the swap waits for the session lock.
    pub async fn check_model_update(&self) -> Result<bool, InferenceError> {
        let path = &self.config.model_path;
        if !path.exists() {
            return Ok(false);
        }
        let bytes = tokio::fs::read(path).await?;
        let hash = sha256_hex(&bytes);
        let current = self.meta.lock().clone();
        if current.as_ref().map(|m| m.hash.as_str()) == Some(hash.as_str()) {
            return Ok(false);
        }

        let backend = match self.registry.backend_for(path) {
            Some(b) => b,
            None => return Ok(false),
        };
        let session = backend.load(path)?;
        warmup(&self.config, session.as_ref());
        {
            let mut mode = self.session.lock().await;
            *mode = EngineMode::Loaded(session);
        }
        *self.meta.lock() = Some(ModelMeta {
            path: path.clone(),
            hash,
            loaded_at_ms: now_ms(),
        });
        info!("model updated from {}", path.display());
        Ok(true)
    }

    /// Run one frame through preprocess, the model (or the simulation
    /// path) and postprocess. `scratch` is the calling worker's reusable
    /// preprocessing buffer.
    pub async fn infer(&self, request: &InferenceRequest, scratch: &mut Vec<f32>) -> GameState {
        let started = std::time::Instant::now();
        let detections = self.infer_detections(request, scratch).await;
        self.inference_count.fetch_add(1, Ordering::Relaxed);
        self.latency
            .lock()
            .push(started.elapsed().as_secs_f64() * 1000.0);

        GameState {
            frame_id: request.frame_id,
            timestamp: request.timestamp,
            detections,
        }
    }

    async fn infer_detections(
        &self,
        request: &InferenceRequest,
        scratch: &mut Vec<f32>,
    ) -> Vec<Detection> {
        // Fast path: simulation mode never touches the tensor pipeline.
        if self.is_simulation() {
            return self.simulate();
        }

        let result = self.run_model(request, scratch).await;
        match result {
            Ok(detections) => detections,
            Err(err) => {
                error!("inference failed: {err}");
                self.inference_errors.fetch_add(1, Ordering::Relaxed);
                self.simulate()
            }
        }
    }

    async fn run_model(
        &self,
        request: &InferenceRequest,
        scratch: &mut Vec<f32>,
    ) -> Result<Vec<Detection>, InferenceError> {
        preprocess(
            &request.payload,
            request.width,
            request.height,
            self.config.model_width,
            self.config.model_height,
            scratch,
        )?;
        let input = InputTensor {
            data: scratch.as_slice(),
            width: self.config.model_width,
            height: self.config.model_height,
        };

        let output = {
            let mode = self.session.lock().await;
            match &*mode {
                EngineMode::Loaded(session) => session.run(&input)?,
                EngineMode::Simulation => {
                    return Ok(self.simulate());
                }
            }
        };

        Ok(postprocess(
            &output,
            self.config.confidence_threshold,
            self.config.nms_threshold,
        ))
    }

    /// Synthetic detections of plausible shape: 0-5 boxes with uniform
    /// positions and sizes, stamped now.
    fn simulate(&self) -> Vec<Detection> {
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(0..=5);
        let timestamp = now_ms();
        (0..count)
            .map(|_| {
                let height = rng.gen_range(0.05..0.2) * 1.5;
                Detection {
                    bbox: BoundingBox::new(
                        rng.gen_range(0.1..0.9),
                        rng.gen_range(0.1..0.9),
                        rng.gen_range(0.05..0.2),
                        height,
                    ),
                    confidence: rng.gen_range(0.6..1.0),
                    class_id: rng.gen_range(0..4),
                    track_id: 0,
                    timestamp,
                }
            })
            .collect()
    }
}

fn load_model(
    config: &EngineConfig,
    registry: &BackendRegistry,
) -> Result<(ModelMeta, Box<dyn ModelSession>), InferenceError> {
    let path = &config.model_path;
    if !path.exists() {
        return Err(InferenceError::ModelNotFound(path.clone()));
    }
    let backend = registry.backend_for(path).ok_or_else(|| {
        InferenceError::ModelLoadFailed(format!("no backend accepts {}", path.display()))
    })?;
    let bytes = std::fs::read(path)?;
    let hash = sha256_hex(&bytes);
    let session = backend.load(path)?;
    warmup(config, session.as_ref());
    Ok((
        ModelMeta {
            path: path.clone(),
            hash,
            loaded_at_ms: now_ms(),
        },
        session,
    ))
}

/// A few blank-frame passes so the first real inference does not pay
/// one-time runtime setup costs.
fn warmup(config: &EngineConfig, session: &dyn ModelSession) {
    let pixels = config.model_width as usize * config.model_height as usize * 3;
    let blank = vec![0.0f32; pixels];
    let input = InputTensor {
        data: &blank,
        width: config.model_width,
        height: config.model_height,
    };
    for _ in 0..3 {
        if let Err(err) = session.run(&input) {
            warn!("model warmup pass failed: {err}");
            return;
        }
    }
    debug!("model warmup complete");
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Bilinear resize of a packed RGB image into planar CHW with `/255`
/// normalization, written into `scratch`.
pub fn preprocess(
    payload: &[u8],
    src_width: u16,
    src_height: u16,
    dst_width: u16,
    dst_height: u16,
    scratch: &mut Vec<f32>,
) -> Result<(), InferenceError> {
    let (sw, sh) = (src_width as usize, src_height as usize);
    let (dw, dh) = (dst_width as usize, dst_height as usize);
    if sw == 0 || sh == 0 {
        return Err(InferenceError::InvalidInput("empty frame".into()));
    }
    if payload.len() != sw * sh * 3 {
        return Err(InferenceError::InvalidInput(format!(
            "payload size {} does not match {}x{} RGB",
            payload.len(),
            sw,
            sh
        )));
    }

    scratch.clear();
    scratch.resize(3 * dw * dh, 0.0);

    let x_scale = sw as f32 / dw as f32;
    let y_scale = sh as f32 / dh as f32;

    for y in 0..dh {
        let src_y = (y as f32 + 0.5) * y_scale - 0.5;
        let y0 = src_y.floor().max(0.0) as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = (src_y - y0 as f32).clamp(0.0, 1.0);
        for x in 0..dw {
            let src_x = (x as f32 + 0.5) * x_scale - 0.5;
            let x0 = src_x.floor().max(0.0) as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = (src_x - x0 as f32).clamp(0.0, 1.0);

            for c in 0..3 {
                let p00 = payload[(y0 * sw + x0) * 3 + c] as f32;
                let p01 = payload[(y0 * sw + x1) * 3 + c] as f32;
                let p10 = payload[(y1 * sw + x0) * 3 + c] as f32;
                let p11 = payload[(y1 * sw + x1) * 3 + c] as f32;
                let top = p00 + (p01 - p00) * fx;
                let bottom = p10 + (p11 - p10) * fx;
                let value = top + (bottom - top) * fy;
                scratch[c * dw * dh + y * dw + x] = value / 255.0;
            }
        }
    }
    Ok(())
}

/// Decode YOLO-family `[1, 4+C, N]` output into detections, then apply
/// per-class NMS. Boxes are normalized centre-format; the class score is
/// the argmax over the C class attributes.
pub fn postprocess(
    output: &OutputTensor,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Vec<Detection> {
    let timestamp = now_ms();
    let mut detections = Vec::new();

    for i in 0..output.candidates {
        let mut best_class = 0usize;
        let mut best_conf = 0.0f32;
        for c in 0..output.classes {
            let conf = output.at(4 + c, i);
            if conf > best_conf {
                best_conf = conf;
                best_class = c;
            }
        }
        if best_conf < confidence_threshold {
            continue;
        }
        let bbox = BoundingBox::new(
            output.at(0, i),
            output.at(1, i),
            output.at(2, i),
            output.at(3, i),
        )
        .clamp_unit();
        detections.push(Detection {
            bbox,
            confidence: best_conf,
            class_id: best_class as u8,
            track_id: 0,
            timestamp,
        });
    }

    non_max_suppression(detections, nms_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_ring_holds_last_hundred() {
        let mut ring = LatencyRing::default();
        for i in 0..250 {
            ring.push(i as f64);
        }
        // samples 150..250 remain
        assert!((ring.mean_ms() - 199.5).abs() < 1e-9);
        assert_eq!(ring.p99_ms(), 248.0);
    }

    #[test]
    fn preprocess_rejects_wrong_payload_size() {
        let mut scratch = Vec::new();
        let err = preprocess(&[0u8; 10], 4, 4, 2, 2, &mut scratch);
        assert!(err.is_err());
    }

    #[test]
    fn preprocess_normalizes_and_reorders_to_chw() {
        // 1x1 source, white pixel: every destination value is 1.0.
        let payload = vec![255u8, 255, 255];
        let mut scratch = Vec::new();
        preprocess(&payload, 1, 1, 2, 2, &mut scratch).unwrap();
        assert_eq!(scratch.len(), 3 * 2 * 2);
        assert!(scratch.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn preprocess_identity_size_keeps_pixels() {
        // 2x1 source: red then blue.
        let payload = vec![255u8, 0, 0, 0, 0, 255];
        let mut scratch = Vec::new();
        preprocess(&payload, 2, 1, 2, 1, &mut scratch).unwrap();
        // CHW planes of width 2: R plane [1, 0], G plane [0, 0], B plane [0, 1]
        assert!((scratch[0] - 1.0).abs() < 1e-6);
        assert!(scratch[1].abs() < 1e-6);
        assert!(scratch[4].abs() < 1e-6);
        assert!((scratch[5] - 1.0).abs() < 1e-6);
    }

    fn tensor(candidates: usize, classes: usize, fill: impl Fn(usize, usize) -> f32) -> OutputTensor {
        let mut data = vec![0.0f32; (4 + classes) * candidates];
        for attr in 0..4 + classes {
            for i in 0..candidates {
                data[attr * candidates + i] = fill(attr, i);
            }
        }
        OutputTensor {
            data,
            classes,
            candidates,
        }
    }

    #[test]
    fn postprocess_takes_argmax_class_and_applies_threshold() {
        let out = tensor(2, 3, |attr, i| match (attr, i) {
            (0, _) => 0.5,
            (1, _) => 0.5,
            (2, _) => 0.1,
            (3, _) => 0.2,
            (5, 0) => 0.9, // candidate 0: class 1 at 0.9
            (6, 1) => 0.3, // candidate 1: class 2 at 0.3, below threshold
            _ => 0.0,
        });
        let dets = postprocess(&out, 0.5, 0.45);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 1);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(dets[0].track_id, 0);
    }

    #[test]
    fn postprocess_suppresses_overlapping_candidates() {
        let out = tensor(2, 1, |attr, i| match (attr, i) {
            (0, _) => 0.5,
            (1, _) => 0.5,
            (2, _) => 0.2,
            (3, _) => 0.2,
            (4, 0) => 0.9,
            (4, 1) => 0.8,
            _ => 0.0,
        });
        let dets = postprocess(&out, 0.5, 0.45);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
    }

    struct StubBackend;
    struct StubSession;

    impl ModelSession for StubSession {
        fn run(&self, _input: &InputTensor<'_>) -> Result<OutputTensor, InferenceError> {
            Ok(OutputTensor {
                data: vec![0.0; 5],
                classes: 1,
                candidates: 1,
            })
        }
    }

    impl ModelBackend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn supports(&self, path: &Path) -> bool {
            path.extension().map(|e| e == "onnx").unwrap_or(false)
        }
        fn load(&self, _path: &Path) -> Result<Box<dyn ModelSession>, InferenceError> {
            Ok(Box::new(StubSession))
        }
    }

    #[tokio::test]
    async fn missing_model_enters_simulation_mode() {
        let config = EngineConfig {
            model_path: PathBuf::from("/definitely/not/here.onnx"),
            ..EngineConfig::default()
        };
        let engine = InferenceEngine::new(config, BackendRegistry::new());
        assert!(engine.is_simulation());

        let request = InferenceRequest {
            client_id: 1,
            frame_id: 42,
            timestamp: 1000,
            width: 640,
            height: 480,
            payload: vec![0; 640 * 480 * 3],
            is_keyframe: false,
        };
        let mut scratch = Vec::new();
        let state = engine.infer(&request, &mut scratch).await;
        assert_eq!(state.frame_id, 42);
        assert!(state.detections.len() <= 5);
        assert!(state.detections.iter().all(|d| d.bbox.is_inside_unit()));
    }

    #[tokio::test]
    async fn model_hot_swap_changes_hash() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.onnx");
        std::fs::write(&model_path, b"weights v1").unwrap();

        let config = EngineConfig {
            model_path: model_path.clone(),
            ..EngineConfig::default()
        };
        let mut registry = BackendRegistry::new();
        registry.register(Box::new(StubBackend));
        let engine = InferenceEngine::new(config, registry);
        assert!(!engine.is_simulation());
        let first_hash = engine.model_meta().unwrap().hash;

        // Unchanged file: no swap.
        assert!(!engine.check_model_update().await.unwrap());

        let mut file = std::fs::File::create(&model_path).unwrap();
        file.write_all(b"weights v2").unwrap();
        drop(file);
        assert!(engine.check_model_update().await.unwrap());
        assert_ne!(engine.model_meta().unwrap().hash, first_hash);
    }
}
