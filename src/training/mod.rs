//! Training module for the corn leaf classifier
//!
//! - [`SampleLoader`]: lazily decoded, optionally shuffled batches over a
//!   dataset index
//! - [`Trainer`]: the epoch loop with validation and a final evaluation

pub mod loader;
pub mod trainer;

pub use loader::{EpochBatches, SampleLoader};
pub use trainer::{
    evaluate_classifier, EpochMetrics, EvaluationReport, Trainer, TrainerPhase, TrainingConfig,
    TrainingRun,
};

