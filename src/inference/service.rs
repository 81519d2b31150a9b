//! Lazily initialized prediction service
//!
//! The service owns one classifier, one inference transform and one device.
//! They are built on first use (or on an explicit [`InferenceService::initialize`])
//! behind a single initialization guard, then shared by every request.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use burn::{
    config::Config,
    module::Module,
    tensor::{activation::softmax, backend::Backend, Tensor, TensorData},
};
use image::ImageReader;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dataset::{TransformConfig, TransformPipeline};
use crate::model::{Classifier, ClassifierConfig, CLASSIFIER_CONFIG_FILE};
use crate::taxonomy;
use crate::utils::error::{DiagnosisError, Result};

/// An image submitted for classification
#[derive(Debug, Clone)]
pub struct ImageUpload {
    /// Caller-facing name of the image, echoed back in results and errors
    pub identifier: String,
    /// Encoded image bytes (PNG, JPEG, ...)
    pub bytes: Vec<u8>,
    /// Declared MIME type, if the caller supplied one
    pub content_type: Option<String>,
}

impl ImageUpload {
    pub fn new(identifier: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            identifier: identifier.into(),
            bytes,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Result of classifying one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub source_identifier: String,
    pub predicted_class_id: usize,
    pub predicted_class_name: String,
    /// Display name in the localized taxonomy
    pub localized_name: String,
    /// Probability of the predicted class, in [0, 1]
    pub confidence: f32,
    /// Softmax distribution over all classes
    pub probabilities: Vec<f32>,
}

impl PredictionResult {
    pub fn display(&self) -> String {
        format!(
            "{}: {} ({}) - {:.2}%",
            self.source_identifier,
            self.predicted_class_name,
            self.localized_name,
            self.confidence * 100.0
        )
    }
}

/// How a request containing a bad image is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BatchPolicy {
    /// The first bad image fails the whole request
    #[default]
    Atomic,
    /// Each image gets its own result
    PerImage,
}

/// Service setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Checkpoint produced by training; missing or unreadable files fall back
    /// to random weights
    pub checkpoint_path: Option<PathBuf>,
    pub classifier: ClassifierConfig,
    pub transform: TransformConfig,
    pub batch_policy: BatchPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: None,
            classifier: ClassifierConfig::new(),
            transform: TransformConfig::new(),
            batch_policy: BatchPolicy::default(),
        }
    }
}

impl ServiceConfig {
    /// Setup for serving a trained checkpoint.
    ///
    /// The classifier architecture is read from the `classifier_config.json`
    /// saved next to the checkpoint; without that file the default 4-class
    /// architecture is assumed.
    pub fn for_checkpoint(checkpoint_path: impl Into<PathBuf>) -> Result<Self> {
        let checkpoint_path = checkpoint_path.into();
        let config_path = checkpoint_path.with_file_name(CLASSIFIER_CONFIG_FILE);

        let classifier = if config_path.is_file() {
            load_classifier_config(&config_path)?
        } else {
            debug!(
                "No {} next to {}, using the default classifier",
                CLASSIFIER_CONFIG_FILE,
                checkpoint_path.display()
            );
            ClassifierConfig::new()
        };

        Ok(Self {
            checkpoint_path: Some(checkpoint_path),
            classifier,
            ..Self::default()
        })
    }
}

fn load_classifier_config(path: &Path) -> Result<ClassifierConfig> {
    let config = ClassifierConfig::load(path).map_err(|e| {
        DiagnosisError::Configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    info!(
        "Classifier config from {} ({} classes)",
        path.display(),
        config.num_classes
    );
    Ok(config)
}

/// Lifecycle of the service's model state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Coarse readiness reported to health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Ready,
    NotReady,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Ready => write!(f, "ready"),
            Health::NotReady => write!(f, "not-ready"),
        }
    }
}

type DeviceSelector<B> = Box<dyn Fn() -> <B as Backend>::Device + Send + Sync>;

/// Model, transform and device, fixed once built
struct Engine<B: Backend> {
    classifier: Mutex<Classifier<B>>,
    transform: TransformPipeline,
    device: B::Device,
}

impl<B: Backend> Engine<B> {
    /// A copy of the classifier for one request
    fn snapshot(&self) -> Result<Classifier<B>> {
        self.classifier
            .lock()
            .map(|model| model.clone())
            .map_err(|_| DiagnosisError::Inference("classifier lock poisoned".to_string()))
    }
}

enum Slot<B: Backend> {
    Uninitialized,
    Initializing,
    Ready(Arc<Engine<B>>),
}

/// Corn leaf prediction service
pub struct InferenceService<B: Backend> {
    config: ServiceConfig,
    select_device: DeviceSelector<B>,
    preloaded: Mutex<Option<Classifier<B>>>,
    slot: RwLock<Slot<B>>,
    init_guard: Mutex<()>,
}

impl<B: Backend> InferenceService<B> {
    /// Service that builds its classifier from `config` on first use
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            select_device: Box::new(<B::Device as Default>::default),
            preloaded: Mutex::new(None),
            slot: RwLock::new(Slot::Uninitialized),
            init_guard: Mutex::new(()),
        }
    }

    /// Service that serves an already built classifier.
    ///
    /// A configured checkpoint is still loaded on top of it.
    pub fn with_classifier(config: ServiceConfig, classifier: Classifier<B>) -> Self {
        let service = Self::new(config);
        Self {
            preloaded: Mutex::new(Some(classifier)),
            ..service
        }
    }

    /// Override how the execution device is chosen. The selector runs once,
    /// during initialization.
    pub fn with_device_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn() -> B::Device + Send + Sync + 'static,
    {
        self.select_device = Box::new(selector);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn status(&self) -> ServiceState {
        match self.slot.read() {
            Ok(slot) => match *slot {
                Slot::Uninitialized => ServiceState::Uninitialized,
                Slot::Initializing => ServiceState::Initializing,
                Slot::Ready(_) => ServiceState::Ready,
            },
            Err(_) => ServiceState::Uninitialized,
        }
    }

    pub fn health(&self) -> Health {
        match self.status() {
            ServiceState::Ready => Health::Ready,
            _ => Health::NotReady,
        }
    }

    /// Device chosen at initialization
    pub fn device(&self) -> Option<B::Device> {
        self.ready_engine()
            .ok()
            .flatten()
            .map(|engine| engine.device.clone())
    }

    /// Build the model state if that has not happened yet
    pub fn initialize(&self) -> Result<()> {
        self.engine().map(|_| ())
    }

    /// Classify every upload, failing the whole request on the first bad image
    pub fn predict(&self, uploads: &[ImageUpload]) -> Result<Vec<PredictionResult>> {
        if uploads.is_empty() {
            return Err(DiagnosisError::Validation("no images submitted".to_string()));
        }

        let engine = self.engine()?;
        let model = engine.snapshot()?;

        uploads
            .iter()
            .map(|upload| predict_one(&engine, &model, upload))
            .collect()
    }

    /// Classify every upload independently
    pub fn predict_each(&self, uploads: &[ImageUpload]) -> Result<Vec<Result<PredictionResult>>> {
        if uploads.is_empty() {
            return Err(DiagnosisError::Validation("no images submitted".to_string()));
        }

        let engine = self.engine()?;
        let model = engine.snapshot()?;

        Ok(uploads
            .iter()
            .map(|upload| predict_one(&engine, &model, upload))
            .collect())
    }

    /// Classify according to the configured [`BatchPolicy`]
    pub fn predict_with_policy(
        &self,
        uploads: &[ImageUpload],
    ) -> Result<Vec<Result<PredictionResult>>> {
        match self.config.batch_policy {
            BatchPolicy::Atomic => Ok(self.predict(uploads)?.into_iter().map(Ok).collect()),
            BatchPolicy::PerImage => self.predict_each(uploads),
        }
    }

    fn ready_engine(&self) -> Result<Option<Arc<Engine<B>>>> {
        let slot = self
            .slot
            .read()
            .map_err(|_| DiagnosisError::Inference("service state lock poisoned".to_string()))?;
        Ok(match &*slot {
            Slot::Ready(engine) => Some(engine.clone()),
            _ => None,
        })
    }

    fn set_slot(&self, value: Slot<B>) -> Result<()> {
        let mut slot = self
            .slot
            .write()
            .map_err(|_| DiagnosisError::Inference("service state lock poisoned".to_string()))?;
        *slot = value;
        Ok(())
    }

    fn engine(&self) -> Result<Arc<Engine<B>>> {
        if let Some(engine) = self.ready_engine()? {
            return Ok(engine);
        }

        // A panicked initialization already reset the slot
        let _guard = self
            .init_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Another caller may have finished while we waited
        if let Some(engine) = self.ready_engine()? {
            return Ok(engine);
        }

        self.set_slot(Slot::Initializing)?;
        let reset = ResetOnFailure {
            slot: &self.slot,
            armed: true,
        };
        let engine = Arc::new(self.build_engine()?);
        self.set_slot(Slot::Ready(engine.clone()))?;
        reset.disarm();

        Ok(engine)
    }

    fn build_engine(&self) -> Result<Engine<B>> {
        let device = (self.select_device)();
        info!("Initializing inference service on device {:?}", device);

        let preloaded = self
            .preloaded
            .lock()
            .map_err(|_| DiagnosisError::Inference("classifier lock poisoned".to_string()))?
            .take();
        let mut classifier = match preloaded {
            Some(classifier) => classifier.to_device(&device),
            None => self.config.classifier.init(&device),
        };

        match &self.config.checkpoint_path {
            Some(path) => {
                let loaded = std::fs::read(path)
                    .map_err(|e| {
                        DiagnosisError::WeightLoad(format!("cannot read {}: {}", path.display(), e))
                    })
                    .and_then(|blob| classifier.load_weights(&blob));
                match loaded {
                    Ok(()) => info!("Loaded checkpoint from {}", path.display()),
                    Err(e) => warn!("{}; serving with randomly initialized weights", e),
                }
            }
            None => warn!("No checkpoint configured; serving with randomly initialized weights"),
        }

        Ok(Engine {
            classifier: Mutex::new(classifier),
            transform: TransformPipeline::inference(self.config.transform.clone()),
            device,
        })
    }
}

/// Puts the slot back to `Uninitialized` unless initialization completed,
/// so the next request retries instead of finding a half-built state.
struct ResetOnFailure<'a, B: Backend> {
    slot: &'a RwLock<Slot<B>>,
    armed: bool,
}

impl<B: Backend> ResetOnFailure<'_, B> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<B: Backend> Drop for ResetOnFailure<'_, B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self
            .slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Slot::Uninitialized;
        warn!("Service initialization failed; state reset to uninitialized");
    }
}

fn predict_one<B: Backend>(
    engine: &Engine<B>,
    model: &Classifier<B>,
    upload: &ImageUpload,
) -> Result<PredictionResult> {
    if let Some(content_type) = &upload.content_type {
        if !content_type.trim().to_ascii_lowercase().starts_with("image/") {
            return Err(DiagnosisError::InvalidInput {
                identifier: upload.identifier.clone(),
                content_type: content_type.clone(),
            });
        }
    }

    let decode_error = |reason: String| DiagnosisError::Decode {
        identifier: upload.identifier.clone(),
        reason,
    };
    let image = ImageReader::new(Cursor::new(&upload.bytes))
        .with_guessed_format()
        .map_err(|e| decode_error(e.to_string()))?
        .decode()
        .map_err(|e| decode_error(e.to_string()))?
        .to_rgb8();

    let tensor = engine.transform.inference_transform(&image);
    let [channels, height, width] = tensor.shape();
    let input = Tensor::<B, 4>::from_floats(
        TensorData::new(tensor.data, [1, channels, height, width]),
        &engine.device,
    );

    let probabilities: Vec<f32> = softmax(model.forward(input), 1)
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| DiagnosisError::Inference(format!("{:?}", e)))?;

    if probabilities.is_empty() || probabilities.iter().any(|p| !p.is_finite()) {
        return Err(DiagnosisError::Inference(format!(
            "model produced an invalid distribution for '{}'",
            upload.identifier
        )));
    }

    // First maximum wins on ties
    let (predicted_class_id, confidence) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (id, p)| {
            if p > best.1 {
                (id, p)
            } else {
                best
            }
        });

    debug!(
        "{} -> class {} ({:.3})",
        upload.identifier, predicted_class_id, confidence
    );

    Ok(PredictionResult {
        source_identifier: upload.identifier.clone(),
        predicted_class_id,
        predicted_class_name: taxonomy::name_of(predicted_class_id).to_string(),
        localized_name: taxonomy::localized_name_of(predicted_class_id).to_string(),
        confidence,
        probabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    use crate::model::ConvNextConfig;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ServiceConfig {
        ServiceConfig {
            classifier: ClassifierConfig::new().with_backbone(
                ConvNextConfig::new()
                    .with_depths(vec![1, 1, 1, 1])
                    .with_dims(vec![4, 8, 8, 8]),
            ),
            transform: TransformConfig::new().with_image_size(32),
            ..ServiceConfig::default()
        }
    }

    fn png_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(20, 20, Rgb([40, 150, 60]))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_lazy_initialization() {
        let service = InferenceService::<TestBackend>::new(small_config());
        assert_eq!(service.status(), ServiceState::Uninitialized);
        assert_eq!(service.health(), Health::NotReady);
        assert!(service.device().is_none());

        service.initialize().unwrap();
        assert_eq!(service.status(), ServiceState::Ready);
        assert_eq!(service.health(), Health::Ready);
        assert!(service.device().is_some());
    }

    #[test]
    fn test_empty_request_does_not_initialize() {
        let service = InferenceService::<TestBackend>::new(small_config());
        assert!(matches!(
            service.predict(&[]),
            Err(DiagnosisError::Validation(_))
        ));
        assert!(matches!(
            service.predict_each(&[]),
            Err(DiagnosisError::Validation(_))
        ));
        assert_eq!(service.status(), ServiceState::Uninitialized);
    }

    #[test]
    fn test_content_type_check_is_case_insensitive() {
        let service = InferenceService::<TestBackend>::new(small_config());
        let upload = ImageUpload::new("leaf.png", png_bytes()).with_content_type("Image/PNG");
        let results = service.predict(&[upload]).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_decode_error_names_upload() {
        let service = InferenceService::<TestBackend>::new(small_config());
        let uploads = vec![
            ImageUpload::new("good.png", png_bytes()),
            ImageUpload::new("garbage.jpg", b"not an image".to_vec()),
        ];

        let err = service.predict(&uploads).unwrap_err();
        assert!(matches!(err, DiagnosisError::Decode { .. }));
        assert_eq!(err.identifier(), Some("garbage.jpg"));
    }

    #[test]
    fn test_per_image_isolation() {
        let config = ServiceConfig {
            batch_policy: BatchPolicy::PerImage,
            ..small_config()
        };
        let service = InferenceService::<TestBackend>::new(config);
        let uploads = vec![
            ImageUpload::new("a.png", png_bytes()),
            ImageUpload::new("notes.txt", b"hello".to_vec()).with_content_type("text/plain"),
            ImageUpload::new("b.png", png_bytes()),
        ];

        let results = service.predict_with_policy(&uploads).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().source_identifier, "a.png");
        assert!(matches!(
            results[1],
            Err(DiagnosisError::InvalidInput { .. })
        ));
        assert_eq!(results[2].as_ref().unwrap().source_identifier, "b.png");
    }

    #[test]
    fn test_atomic_policy_fails_whole_request() {
        let service = InferenceService::<TestBackend>::new(small_config());
        let uploads = vec![
            ImageUpload::new("a.png", png_bytes()),
            ImageUpload::new("notes.txt", b"hello".to_vec()).with_content_type("text/plain"),
        ];
        assert!(service.predict_with_policy(&uploads).is_err());
    }

    #[test]
    fn test_config_for_checkpoint_reads_sibling_classifier_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let checkpoint = dir.path().join("model.bin");
        small_config()
            .classifier
            .with_num_classes(3)
            .save(dir.path().join(CLASSIFIER_CONFIG_FILE))
            .unwrap();

        let config = ServiceConfig::for_checkpoint(&checkpoint).unwrap();
        assert_eq!(config.checkpoint_path.as_deref(), Some(checkpoint.as_path()));
        assert_eq!(config.classifier.num_classes, 3);
        assert_eq!(config.classifier.backbone.depths, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_config_for_checkpoint_without_sibling_uses_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServiceConfig::for_checkpoint(dir.path().join("model.bin")).unwrap();
        assert_eq!(config.classifier.num_classes, 4);
    }

    #[test]
    fn test_unreadable_classifier_config_is_configuration_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(CLASSIFIER_CONFIG_FILE), "{ not json").unwrap();
        let result = ServiceConfig::for_checkpoint(dir.path().join("model.bin"));
        assert!(matches!(result, Err(DiagnosisError::Configuration(_))));
    }

    #[test]
    fn test_failed_initialization_resets_state() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let failed_once = Arc::new(AtomicBool::new(false));
        let flag = failed_once.clone();
        let service = InferenceService::<TestBackend>::new(small_config()).with_device_selector(
            move || {
                if !flag.swap(true, Ordering::SeqCst) {
                    panic!("device not available yet");
                }
                Default::default()
            },
        );

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            service.initialize()
        }));
        assert!(outcome.is_err());
        assert_eq!(service.status(), ServiceState::Uninitialized);
        assert_eq!(service.health(), Health::NotReady);

        // the guard is usable again after the panic
        service.initialize().unwrap();
        assert!(failed_once.load(Ordering::SeqCst));
        assert_eq!(service.status(), ServiceState::Ready);
    }

    #[test]
    fn test_health_display() {
        assert_eq!(Health::Ready.to_string(), "ready");
        assert_eq!(Health::NotReady.to_string(), "not-ready");
    }
}
