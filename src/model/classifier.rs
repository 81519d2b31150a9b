//! Corn leaf classifier: ConvNeXt backbone + linear head
//!
//! The classifier produces raw logits; softmax is applied by callers. Freezing
//! the backbone only changes which parameters track gradients, never the
//! numbers a forward pass produces.

use burn::{
    config::Config,
    module::{Module, ModuleMapper, ModuleVisitor, Param},
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder, RecorderError},
    tensor::{backend::Backend, Tensor},
};
use tracing::{debug, info};

use crate::model::backbone::{ConvNext, ConvNextConfig, ConvNextRecord, FeatureExtractor};
use crate::model::head::ClassificationHead;
use crate::utils::error::{self, DiagnosisError};

/// Recorder used for checkpoint blobs; decode failures come back as `RecorderError`
pub type CheckpointRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Configuration for the classifier
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// Number of output classes
    #[config(default = "4")]
    pub num_classes: usize,

    /// Backbone architecture
    #[config(default = "ConvNextConfig::tiny()")]
    pub backbone: ConvNextConfig,

    /// Seed the backbone from externally supplied pretrained weights
    #[config(default = "false")]
    pub use_pretrained_backbone: bool,
}

impl ClassifierConfig {
    /// Build a classifier with randomly initialized parameters
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let backbone = self.backbone.init(device);
        let head = ClassificationHead::new(backbone.feature_dim(), self.num_classes, device);

        Classifier { backbone, head }
    }

    /// Build a classifier whose backbone is loaded from a backbone-only blob.
    ///
    /// The head is always freshly initialized.
    pub fn init_pretrained<B: Backend>(
        &self,
        device: &B::Device,
        backbone_blob: &[u8],
    ) -> error::Result<Classifier<B>> {
        let mut classifier = self.init(device);

        let record: ConvNextRecord<B> = decode_record(backbone_blob, device)
            .map_err(|e| DiagnosisError::WeightLoad(format!("corrupt backbone blob: {}", e)))?;

        check_stage_layout(&classifier.backbone, &record)?;
        let loaded = classifier.backbone.clone().load_record(record);
        check_same_shapes(&classifier.backbone, &loaded)?;
        classifier.backbone = loaded;

        info!("Seeded backbone from pretrained weights");
        Ok(classifier)
    }
}

/// Image classifier made of a feature extractor and a classification head
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    backbone: ConvNext<B>,
    head: ClassificationHead<B>,
}

impl<B: Backend> Classifier<B> {
    /// Logits of shape `[batch_size, num_classes]` for images `[batch_size, 3, H, W]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.extract(images))
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    pub fn feature_dim(&self) -> usize {
        self.backbone.feature_dim()
    }

    pub fn backbone(&self) -> &ConvNext<B> {
        &self.backbone
    }

    pub fn head(&self) -> &ClassificationHead<B> {
        &self.head
    }

    /// Swap in a different head. Its input width must match the backbone.
    pub fn replace_head(mut self, head: ClassificationHead<B>) -> error::Result<Self> {
        if head.feature_dim() != self.backbone.feature_dim() {
            return Err(DiagnosisError::Configuration(format!(
                "head expects {} features but the backbone produces {}",
                head.feature_dim(),
                self.backbone.feature_dim()
            )));
        }
        self.head = head;
        Ok(self)
    }

    /// Stop gradient tracking for every backbone parameter; the head stays trainable
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.map(&mut RequireGrad(false));
        self.head = self.head.map(&mut RequireGrad(true));
        debug!("Backbone frozen");
        self
    }

    /// Resume gradient tracking for the backbone
    pub fn unfreeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.map(&mut RequireGrad(true));
        self.head = self.head.map(&mut RequireGrad(true));
        debug!("Backbone unfrozen");
        self
    }

    /// Whether every backbone parameter tracks gradients
    pub fn backbone_trainable(&self) -> bool {
        all_require_grad(&self.backbone)
    }

    /// Whether every head parameter tracks gradients
    pub fn head_trainable(&self) -> bool {
        all_require_grad(&self.head)
    }

    /// Replace all parameters with those stored in a checkpoint blob.
    ///
    /// The blob must describe exactly this architecture. On any failure the
    /// classifier is left untouched and a `WeightLoad` error is returned.
    pub fn load_weights(&mut self, blob: &[u8]) -> error::Result<()> {
        let device = self.head.device();
        let record: ClassifierRecord<B> = decode_record(blob, &device)
            .map_err(|e| DiagnosisError::WeightLoad(format!("corrupt checkpoint: {}", e)))?;

        let head_dims = record.head.linear.weight.dims();
        let expected = [self.feature_dim(), self.num_classes()];
        if head_dims != expected {
            return Err(DiagnosisError::WeightLoad(format!(
                "head shape mismatch: checkpoint has {:?}, model expects {:?}",
                head_dims, expected
            )));
        }
        check_stage_layout(&self.backbone, &record.backbone)?;

        let backbone_frozen = !self.backbone_trainable() && self.head_trainable();
        let loaded = self.clone().load_record(record);
        check_same_shapes(self, &loaded)?;

        *self = if backbone_frozen {
            loaded.freeze_backbone()
        } else {
            loaded
        };

        info!("Loaded {} parameters from checkpoint", self.num_params());
        Ok(())
    }

    /// Serialize all parameters into a checkpoint blob accepted by [`Self::load_weights`]
    pub fn to_bytes(&self) -> error::Result<Vec<u8>> {
        encode_record::<B, _>(self.clone().into_record()).map_err(|e| {
            DiagnosisError::Serialization(format!("failed to encode checkpoint: {}", e))
        })
    }

    /// Serialize only the backbone, for [`ClassifierConfig::init_pretrained`]
    pub fn backbone_to_bytes(&self) -> error::Result<Vec<u8>> {
        encode_record::<B, _>(self.backbone.clone().into_record()).map_err(|e| {
            DiagnosisError::Serialization(format!("failed to encode backbone: {}", e))
        })
    }
}

fn decode_record<B: Backend, R: Record<B>>(
    blob: &[u8],
    device: &B::Device,
) -> std::result::Result<R, RecorderError> {
    Recorder::<B>::load(&CheckpointRecorder::default(), blob.to_vec(), device)
}

fn encode_record<B: Backend, R: Record<B>>(
    record: R,
) -> std::result::Result<Vec<u8>, RecorderError> {
    Recorder::<B>::record(&CheckpointRecorder::default(), record, ())
}

fn check_stage_layout<B: Backend>(
    backbone: &ConvNext<B>,
    record: &ConvNextRecord<B>,
) -> error::Result<()> {
    let recorded: Vec<usize> = record.stages.iter().map(|stage| stage.blocks.len()).collect();
    let expected = backbone.stage_depths();
    if recorded != expected {
        return Err(DiagnosisError::WeightLoad(format!(
            "backbone layout mismatch: checkpoint has stage depths {:?}, model expects {:?}",
            recorded, expected
        )));
    }
    Ok(())
}

fn check_same_shapes<B: Backend, M: Module<B>>(
    expected: &M,
    loaded: &M,
) -> error::Result<()> {
    let expected_shapes = param_shapes(expected);
    let loaded_shapes = param_shapes(loaded);

    if expected_shapes.len() != loaded_shapes.len() {
        return Err(DiagnosisError::WeightLoad(format!(
            "parameter count mismatch: checkpoint has {}, model expects {}",
            loaded_shapes.len(),
            expected_shapes.len()
        )));
    }

    for (index, (want, got)) in expected_shapes.iter().zip(loaded_shapes.iter()).enumerate() {
        if want != got {
            return Err(DiagnosisError::WeightLoad(format!(
                "parameter {} shape mismatch: checkpoint has {:?}, model expects {:?}",
                index, got, want
            )));
        }
    }

    Ok(())
}

/// Sets gradient tracking on every float parameter
struct RequireGrad(bool);

impl<B: Backend> ModuleMapper<B> for RequireGrad {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let require_grad = self.0;
        param.map(|tensor| tensor.set_require_grad(require_grad))
    }
}

/// Collects gradient flags and shapes of float parameters
#[derive(Default)]
struct ParamInspector {
    require_grad: Vec<bool>,
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamInspector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        self.require_grad.push(tensor.is_require_grad());
        self.shapes.push(tensor.dims().to_vec());
    }
}

fn inspect<B: Backend, M: Module<B>>(module: &M) -> ParamInspector {
    let mut inspector = ParamInspector::default();
    module.visit(&mut inspector);
    inspector
}

fn all_require_grad<B: Backend, M: Module<B>>(module: &M) -> bool {
    let inspector = inspect(module);
    !inspector.require_grad.is_empty() && inspector.require_grad.iter().all(|&flag| flag)
}

fn param_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    inspect(module).shapes
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn small_config(num_classes: usize) -> ClassifierConfig {
        ClassifierConfig::new()
            .with_num_classes(num_classes)
            .with_backbone(
                ConvNextConfig::new()
                    .with_depths(vec![1, 1, 1, 1])
                    .with_dims(vec![8, 16, 32, 64]),
            )
    }

    fn random_images<B: Backend>(batch: usize, device: &B::Device) -> Tensor<B, 4> {
        Tensor::random([batch, 3, 32, 32], Distribution::Normal(0.0, 1.0), device)
    }

    #[test]
    fn test_default_config() {
        let config = ClassifierConfig::new();
        assert_eq!(config.num_classes, 4);
        assert_eq!(config.backbone.feature_dim(), 768);
        assert!(!config.use_pretrained_backbone);
    }

    #[test]
    fn test_forward_shape_for_any_batch_size() {
        let device = Default::default();
        let model = small_config(4).init::<TestBackend>(&device);

        for batch in [1, 2, 5] {
            let logits = model.forward(random_images::<TestBackend>(batch, &device));
            assert_eq!(logits.dims(), [batch, 4]);
        }
    }

    #[test]
    fn test_freeze_and_unfreeze_flags() {
        let device = Default::default();
        let model = small_config(4).init::<TestAutodiffBackend>(&device);
        assert!(model.backbone_trainable());
        assert!(model.head_trainable());

        let model = model.freeze_backbone();
        assert!(!model.backbone_trainable());
        assert!(model.head_trainable());

        let model = model.unfreeze_backbone();
        assert!(model.backbone_trainable());
        assert!(model.head_trainable());
    }

    #[test]
    fn test_freezing_does_not_change_outputs() {
        let device = Default::default();
        let model = small_config(4).init::<TestAutodiffBackend>(&device);
        let images = random_images::<TestAutodiffBackend>(2, &device);

        let before: Vec<f32> = model
            .forward(images.clone())
            .into_data()
            .convert::<f32>()
            .to_vec()
            .unwrap();
        let frozen = model.freeze_backbone();
        let after: Vec<f32> = frozen
            .forward(images)
            .into_data()
            .convert::<f32>()
            .to_vec()
            .unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_weights_round_trip() {
        let device = Default::default();
        let source = small_config(4).init::<TestBackend>(&device);
        let blob = source.to_bytes().unwrap();

        let mut target = small_config(4).init::<TestBackend>(&device);
        target.load_weights(&blob).unwrap();

        let images = random_images::<TestBackend>(1, &device);
        let expected: Vec<f32> = source.forward(images.clone()).into_data().to_vec().unwrap();
        let actual: Vec<f32> = target.forward(images).into_data().to_vec().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_corrupt_blob_leaves_model_untouched() {
        let device = Default::default();
        let mut model = small_config(4).init::<TestBackend>(&device);
        let images = random_images::<TestBackend>(1, &device);
        let before: Vec<f32> = model.forward(images.clone()).into_data().to_vec().unwrap();

        let result = model.load_weights(b"definitely not a checkpoint");
        assert!(matches!(result, Err(DiagnosisError::WeightLoad(_))));

        let after: Vec<f32> = model.forward(images).into_data().to_vec().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_head_shape_mismatch_is_rejected() {
        let device = Default::default();
        let blob = small_config(3).init::<TestBackend>(&device).to_bytes().unwrap();

        let mut model = small_config(4).init::<TestBackend>(&device);
        let result = model.load_weights(&blob);
        assert!(matches!(result, Err(DiagnosisError::WeightLoad(_))));
        assert_eq!(model.num_classes(), 4);
    }

    #[test]
    fn test_backbone_layout_mismatch_is_rejected() {
        let device = Default::default();
        let other = ClassifierConfig::new().with_backbone(
            ConvNextConfig::new()
                .with_depths(vec![2, 1, 1, 1])
                .with_dims(vec![8, 16, 32, 64]),
        );
        let blob = other.init::<TestBackend>(&device).to_bytes().unwrap();

        let mut model = small_config(4).init::<TestBackend>(&device);
        assert!(matches!(
            model.load_weights(&blob),
            Err(DiagnosisError::WeightLoad(_))
        ));
    }

    #[test]
    fn test_replace_head() {
        let device = Default::default();
        let model = small_config(4).init::<TestBackend>(&device);

        let weight = Tensor::<TestBackend, 2>::zeros([64, 4], &device);
        let bias = Tensor::<TestBackend, 1>::from_floats(
            TensorData::new(vec![0.0f32, 10.0, 0.0, 0.0], [4]),
            &device,
        );
        let model = model
            .replace_head(ClassificationHead::from_weights(weight, Some(bias)))
            .unwrap();

        let predicted: Vec<i64> = model
            .forward(random_images::<TestBackend>(3, &device))
            .argmax(1)
            .reshape([3])
            .into_data()
            .convert::<i64>()
            .to_vec()
            .unwrap();
        assert_eq!(predicted, vec![1, 1, 1]);

        let wrong = ClassificationHead::<TestBackend>::new(10, 4, &device);
        assert!(model.replace_head(wrong).is_err());
    }

    #[test]
    fn test_pretrained_backbone_seeding() {
        let device = Default::default();
        let config = small_config(4);
        let donor = config.init::<TestBackend>(&device);
        let blob = donor.backbone_to_bytes().unwrap();

        let seeded = config.init_pretrained::<TestBackend>(&device, &blob).unwrap();

        let images = random_images::<TestBackend>(1, &device);
        let expected: Vec<f32> = donor
            .backbone()
            .extract(images.clone())
            .into_data()
            .to_vec()
            .unwrap();
        let actual: Vec<f32> = seeded.backbone().extract(images).into_data().to_vec().unwrap();
        assert_eq!(expected, actual);

        assert!(config
            .init_pretrained::<TestBackend>(&device, b"garbage")
            .is_err());
    }
}
