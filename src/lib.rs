//! # Corn Diagnosis
//!
//! Corn leaf disease classification built on the Burn framework.
//!
//! ## Modules
//!
//! - `taxonomy`: the fixed set of disease classes and their names
//! - `dataset`: directory indexing, preprocessing/augmentation and batching
//! - `model`: ConvNeXt backbone, replaceable head and checkpoint handling
//! - `training`: batch loading and the epoch loop
//! - `inference`: the lazily initialized prediction service
//! - `utils`: errors, logging and classification metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use corn_diagnosis::inference::{ImageUpload, InferenceService, ServiceConfig};
//! use corn_diagnosis::backend::InferenceBackend;
//!
//! let service = InferenceService::<InferenceBackend>::new(ServiceConfig::default());
//! let results = service.predict(&[ImageUpload::new("leaf.jpg", bytes)])?;
//! ```

pub mod backend;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod taxonomy;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use dataset::{DatasetIndex, Sample, TransformConfig, TransformPipeline};
pub use inference::{ImageUpload, InferenceService, PredictionResult, ServiceConfig};
pub use model::{Classifier, ClassifierConfig};
pub use taxonomy::DiseaseClass;
pub use training::{Trainer, TrainingConfig, TrainingRun};
pub use utils::error::{DiagnosisError, Result};
pub use utils::metrics::{ConfusionMatrix, Metrics};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
