//! Training loop for the corn leaf classifier
//!
//! A [`Trainer`] drives one run through the phases
//! `Idle -> Training(1..=N) -> Evaluating -> Done`:
//! - Cross-entropy loss with Adam and weight decay
//! - Per-epoch mean loss, train accuracy and validation accuracy
//! - A final evaluation pass with per-sample predictions

use burn::{
    config::Config,
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::{LeafBatch, LeafBatcher, LeafItem};
use crate::model::Classifier;
use crate::training::loader::SampleLoader;
use crate::utils::error::{self, DiagnosisError};
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::Metrics;

/// Training hyperparameters
#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = "10")]
    pub num_epochs: usize,

    #[config(default = "32")]
    pub batch_size: usize,

    #[config(default = "1e-3")]
    pub learning_rate: f64,

    /// Adam weight decay penalty
    #[config(default = "1e-4")]
    pub weight_decay: f64,

    /// Log the running loss every `log_interval` batches
    #[config(default = "10")]
    pub log_interval: usize,

    #[config(default = "42")]
    pub seed: u64,

    /// Share of each class held out for validation
    #[config(default = "0.2")]
    pub validation_fraction: f64,

    /// Train only the classification head
    #[config(default = "false")]
    pub freeze_backbone: bool,
}

/// Where a trainer is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerPhase {
    Idle,
    Training { epoch: usize, total_epochs: usize },
    Evaluating,
    Done,
}

/// Bookkeeping for one finished epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number
    pub epoch: usize,
    /// Mean cross-entropy over the epoch's batches
    pub train_loss: f64,
    /// Percent of training samples classified correctly
    pub train_accuracy: f64,
    /// Percent of validation samples classified correctly
    pub val_accuracy: f64,
}

/// Result of an evaluation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Fraction of samples classified correctly, in [0, 1]
    pub accuracy: f64,
    /// Predicted class id per sample, in loader order
    pub predictions: Vec<usize>,
    /// True class id per sample, in loader order
    pub ground_truth: Vec<usize>,
    /// Classification report
    pub metrics: Metrics,
}

/// History of a full training invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub epochs: Vec<EpochMetrics>,
    pub evaluation: EvaluationReport,
}

impl TrainingRun {
    /// Best validation accuracy (percent) over all epochs
    pub fn best_val_accuracy(&self) -> f64 {
        self.epochs
            .iter()
            .map(|e| e.val_accuracy)
            .fold(0.0, f64::max)
    }
}

/// Drives the train/validate loop for a [`Classifier`]
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    phase: TrainerPhase,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            phase: TrainerPhase::Idle,
        }
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train `model` and return it together with the run history.
    ///
    /// Fails fast with a `Configuration` error on empty loaders, on a dataset
    /// with more classes than the model outputs, or when the trainer has
    /// already been used. A data loading error aborts the run.
    pub fn fit(
        &mut self,
        model: Classifier<B>,
        train: &SampleLoader,
        valid: &SampleLoader,
    ) -> error::Result<(Classifier<B>, TrainingRun)> {
        if self.phase != TrainerPhase::Idle {
            return Err(DiagnosisError::Configuration(format!(
                "trainer is not idle (phase {:?})",
                self.phase
            )));
        }
        if train.is_empty() {
            return Err(DiagnosisError::Configuration(
                "training loader is empty".to_string(),
            ));
        }
        if valid.is_empty() {
            return Err(DiagnosisError::Configuration(
                "validation loader is empty".to_string(),
            ));
        }
        if self.config.num_epochs == 0 {
            return Err(DiagnosisError::Configuration(
                "number of epochs must be at least 1".to_string(),
            ));
        }
        check_class_count(model.num_classes(), train)?;
        check_class_count(model.num_classes(), valid)?;

        let mut model = if self.config.freeze_backbone {
            model.freeze_backbone()
        } else {
            model
        };

        let mut optimizer = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(self.config.weight_decay as f32)))
            .init();

        let total_epochs = self.config.num_epochs;
        let mut logger = TrainingLogger::new(total_epochs);
        let mut history = Vec::with_capacity(total_epochs);

        info!(
            "Training on {} samples, validating on {} ({} epochs, batch size {}, lr {})",
            train.len(),
            valid.len(),
            total_epochs,
            train.batch_size(),
            self.config.learning_rate
        );

        for epoch in 1..=total_epochs {
            self.phase = TrainerPhase::Training {
                epoch,
                total_epochs,
            };
            logger.start_epoch(epoch);

            let mut epoch_loss = 0.0f64;
            let mut num_batches = 0usize;
            let mut correct = 0usize;
            let mut seen = 0usize;
            let total_batches = train.num_batches();

            for (batch_idx, items) in train.batches(epoch).enumerate() {
                let batch: LeafBatch<B> =
                    Batcher::<B, LeafItem, LeafBatch<B>>::batch(&LeafBatcher, items?, &self.device);
                let batch_size = batch.targets.dims()[0];

                let output = model.forward(batch.images);
                let loss = CrossEntropyLossConfig::new()
                    .init(&output.device())
                    .forward(output.clone(), batch.targets.clone());

                let loss_value: f64 = loss.clone().into_scalar().elem();
                epoch_loss += loss_value;
                num_batches += 1;

                let batch_correct: i64 = output
                    .argmax(1)
                    .reshape([batch_size])
                    .equal(batch.targets)
                    .int()
                    .sum()
                    .into_scalar()
                    .elem();
                correct += batch_correct as usize;
                seen += batch_size;

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(self.config.learning_rate, model, grads);

                if self.config.log_interval > 0 && (batch_idx + 1) % self.config.log_interval == 0 {
                    info!(
                        "  Batch {:>4}/{}: loss = {:.4}, acc = {:.2}%",
                        batch_idx + 1,
                        total_batches,
                        loss_value,
                        100.0 * correct as f64 / seen as f64
                    );
                } else {
                    debug!("  Batch {}/{}: loss = {:.4}", batch_idx + 1, total_batches, loss_value);
                }
            }

            let train_loss = epoch_loss / num_batches.max(1) as f64;
            let train_accuracy = 100.0 * correct as f64 / seen.max(1) as f64;

            let val_report = evaluate_classifier(&model.valid(), valid, &self.device)?;
            let val_accuracy = 100.0 * val_report.accuracy;

            logger.end_epoch(train_loss, train_accuracy, val_accuracy);
            history.push(EpochMetrics {
                epoch,
                train_loss,
                train_accuracy,
                val_accuracy,
            });
        }

        self.phase = TrainerPhase::Evaluating;
        let evaluation = self.evaluate(&model.valid(), valid)?;

        self.phase = TrainerPhase::Done;
        logger.log_complete(evaluation.accuracy);

        Ok((
            model,
            TrainingRun {
                epochs: history,
                evaluation,
            },
        ))
    }

    /// Gradient-free evaluation on `loader`
    pub fn evaluate(
        &self,
        model: &Classifier<B::InnerBackend>,
        loader: &SampleLoader,
    ) -> error::Result<EvaluationReport> {
        evaluate_classifier(model, loader, &self.device)
    }
}

/// Run `model` over every batch of `loader` and collect predictions
pub fn evaluate_classifier<B: Backend>(
    model: &Classifier<B>,
    loader: &SampleLoader,
    device: &B::Device,
) -> error::Result<EvaluationReport> {
    if loader.is_empty() {
        return Err(DiagnosisError::Configuration(
            "evaluation loader is empty".to_string(),
        ));
    }
    check_class_count(model.num_classes(), loader)?;

    let mut predictions = Vec::with_capacity(loader.len());
    let mut ground_truth = Vec::with_capacity(loader.len());

    for items in loader.batches(0) {
        let items = items?;
        ground_truth.extend(items.iter().map(|item| item.class_id));

        let batch: LeafBatch<B> =
            Batcher::<B, LeafItem, LeafBatch<B>>::batch(&LeafBatcher, items, device);
        let batch_size = batch.targets.dims()[0];

        let predicted: Vec<i64> = model
            .forward(batch.images)
            .argmax(1)
            .reshape([batch_size])
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(|e| DiagnosisError::Inference(format!("{:?}", e)))?;
        predictions.extend(predicted.into_iter().map(|id| id as usize));
    }

    let metrics = Metrics::from_predictions(&predictions, &ground_truth, model.num_classes())
        .with_class_names(loader.index().class_names());

    Ok(EvaluationReport {
        accuracy: metrics.accuracy,
        predictions,
        ground_truth,
        metrics,
    })
}

fn check_class_count(model_classes: usize, loader: &SampleLoader) -> error::Result<()> {
    let dataset_classes = loader.index().num_classes();
    if dataset_classes > model_classes {
        return Err(DiagnosisError::Configuration(format!(
            "dataset has {} classes but the model only outputs {}",
            dataset_classes, model_classes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use burn::backend::Autodiff;
    use burn::tensor::{Distribution, Tensor};
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    use crate::dataset::{DatasetIndex, TransformConfig, TransformPipeline};
    use crate::model::{ClassifierConfig, ConvNextConfig, FeatureExtractor};

    type TestBackend = Autodiff<NdArray<f32>>;

    const CLASSES: [&str; 4] = ["CercosporaLeafSpot", "Healthy", "NorthernLeafBlight", "Rust"];

    fn build_index() -> (TempDir, Arc<DatasetIndex>) {
        build_index_with(&CLASSES)
    }

    fn build_index_with(classes: &[&str]) -> (TempDir, Arc<DatasetIndex>) {
        let dir = TempDir::new().unwrap();
        for (id, class) in classes.iter().enumerate() {
            let variant = dir.path().join(class).join("Color");
            std::fs::create_dir_all(&variant).unwrap();
            let shade = (id * 40) as u8;
            for i in 0..2u8 {
                RgbImage::from_pixel(12, 12, Rgb([shade, 160 - shade / 2, 30 + i]))
                    .save(variant.join(format!("{}.png", i)))
                    .unwrap();
            }
        }
        let index = DatasetIndex::build(dir.path(), &["Color"]).unwrap();
        (dir, Arc::new(index))
    }

    fn loaders(index: Arc<DatasetIndex>) -> (SampleLoader, SampleLoader) {
        let transform = TransformConfig::new().with_image_size(32);
        let train = SampleLoader::full(index.clone(), TransformPipeline::training(transform.clone()), 4)
            .unwrap()
            .with_shuffle(1);
        let valid = SampleLoader::full(index, TransformPipeline::inference(transform), 4).unwrap();
        (train, valid)
    }

    fn small_model(device: &<TestBackend as Backend>::Device) -> Classifier<TestBackend> {
        ClassifierConfig::new()
            .with_backbone(
                ConvNextConfig::new()
                    .with_depths(vec![1, 1, 1, 1])
                    .with_dims(vec![4, 8, 8, 8]),
            )
            .init(device)
    }

    fn config(epochs: usize) -> TrainingConfig {
        TrainingConfig::new()
            .with_num_epochs(epochs)
            .with_batch_size(4)
            .with_log_interval(1)
    }

    #[test]
    fn test_fit_records_history_and_evaluation() {
        let (_dir, index) = build_index();
        let (train, valid) = loaders(index);
        let device = Default::default();

        let mut trainer = Trainer::<TestBackend>::new(config(2), device);
        assert_eq!(trainer.phase(), TrainerPhase::Idle);

        let (_model, run) = trainer.fit(small_model(&device), &train, &valid).unwrap();

        assert_eq!(trainer.phase(), TrainerPhase::Done);
        assert_eq!(run.epochs.len(), 2);
        assert_eq!(run.epochs[1].epoch, 2);
        for epoch in &run.epochs {
            assert!(epoch.train_loss.is_finite());
            assert!((0.0..=100.0).contains(&epoch.train_accuracy));
            assert!((0.0..=100.0).contains(&epoch.val_accuracy));
        }

        assert_eq!(run.evaluation.predictions.len(), 8);
        assert_eq!(run.evaluation.ground_truth, vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert!(run.evaluation.predictions.iter().all(|&p| p < 4));
        assert!((0.0..=1.0).contains(&run.evaluation.accuracy));
    }

    #[test]
    fn test_empty_loader_is_configuration_error() {
        let (_dir, index) = build_index();
        let (train, _) = loaders(index.clone());
        let empty = SampleLoader::new(
            index,
            Vec::new(),
            TransformPipeline::inference(TransformConfig::new().with_image_size(32)),
            4,
        )
        .unwrap();
        let device = Default::default();

        let mut trainer = Trainer::<TestBackend>::new(config(1), device);
        let result = trainer.fit(small_model(&device), &train, &empty);
        assert!(matches!(result, Err(DiagnosisError::Configuration(_))));

        let result = trainer.fit(small_model(&device), &empty, &train);
        assert!(matches!(result, Err(DiagnosisError::Configuration(_))));
        assert_eq!(trainer.phase(), TrainerPhase::Idle);
    }

    #[test]
    fn test_more_dataset_classes_than_outputs_is_rejected() {
        let (_dir, index) = build_index_with(&[
            "CercosporaLeafSpot",
            "CommonSmut",
            "GrayLeafSpot",
            "Healthy",
            "NorthernLeafBlight",
            "Rust",
        ]);
        assert_eq!(index.num_classes(), 6);
        let (train, valid) = loaders(index);
        let device = Default::default();

        let mut trainer = Trainer::<TestBackend>::new(config(1), device);
        let result = trainer.fit(small_model(&device), &train, &valid);
        assert!(matches!(result, Err(DiagnosisError::Configuration(_))));
        assert_eq!(trainer.phase(), TrainerPhase::Idle);

        let result = trainer.evaluate(&small_model(&device).valid(), &valid);
        assert!(matches!(result, Err(DiagnosisError::Configuration(_))));
    }

    #[test]
    fn test_trainer_runs_once() {
        let (_dir, index) = build_index();
        let (train, valid) = loaders(index);
        let device = Default::default();

        let mut trainer = Trainer::<TestBackend>::new(config(1), device);
        trainer.fit(small_model(&device), &train, &valid).unwrap();

        let again = trainer.fit(small_model(&device), &train, &valid);
        assert!(matches!(again, Err(DiagnosisError::Configuration(_))));
    }

    #[test]
    fn test_frozen_backbone_is_not_updated() {
        let (_dir, index) = build_index();
        let (train, valid) = loaders(index);
        let device = Default::default();

        let model = small_model(&device);
        let images = Tensor::<NdArray<f32>, 4>::random(
            [1, 3, 32, 32],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let before: Vec<f32> = model
            .valid()
            .backbone()
            .extract(images.clone())
            .into_data()
            .to_vec()
            .unwrap();

        let mut trainer =
            Trainer::<TestBackend>::new(config(1).with_freeze_backbone(true), device);
        let (trained, _) = trainer.fit(model, &train, &valid).unwrap();
        assert!(!trained.backbone_trainable());

        let after: Vec<f32> = trained
            .valid()
            .backbone()
            .extract(images)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_training_config_serializes() {
        let config = config(3).with_freeze_backbone(true);
        let json = serde_json::to_string(&config).unwrap();
        let restored: TrainingConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.num_epochs, 3);
        assert!(restored.freeze_backbone);
        assert_eq!(restored.seed, config.seed);
    }

    #[test]
    fn test_best_val_accuracy() {
        let run = TrainingRun {
            epochs: vec![
                EpochMetrics {
                    epoch: 1,
                    train_loss: 1.0,
                    train_accuracy: 40.0,
                    val_accuracy: 35.0,
                },
                EpochMetrics {
                    epoch: 2,
                    train_loss: 0.8,
                    train_accuracy: 55.0,
                    val_accuracy: 50.0,
                },
            ],
            evaluation: EvaluationReport {
                accuracy: 0.5,
                predictions: vec![],
                ground_truth: vec![],
                metrics: Metrics::default(),
            },
        };
        assert_eq!(run.best_val_accuracy(), 50.0);
    }
}
