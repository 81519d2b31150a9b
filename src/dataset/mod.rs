//! Dataset module for corn leaf images
//!
//! This module provides functionality for:
//! - Indexing a `root/<Class>/<Variant>/` image tree with deterministic class ids
//! - Preprocessing and augmentation of decoded images
//! - Batching preprocessed images into Burn tensors

pub mod batcher;
pub mod index;
pub mod transform;

// Re-export main types for convenience
pub use batcher::{LeafBatch, LeafBatcher, LeafItem};
pub use index::{DatasetIndex, Sample, DEFAULT_VARIANTS, IMAGE_EXTENSIONS};
pub use transform::{
    ImageTensor, TransformConfig, TransformMode, TransformPipeline, IMAGENET_MEAN, IMAGENET_STD,
};
