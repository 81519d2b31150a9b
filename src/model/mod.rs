//! Model module for the corn leaf classifier using the Burn framework
//!
//! This module provides:
//! - A ConvNeXt feature extractor
//! - A replaceable linear classification head
//! - The combined classifier with backbone freezing and checkpoint bytes
//!
//! ## Architecture
//!
//! ConvNeXt-Tiny (feature width 768) followed by a single linear layer
//! mapping features to the 4 corn leaf classes.

pub mod backbone;
pub mod classifier;
pub mod head;

// Re-export main types for convenience
pub use backbone::{ConvNext, ConvNextConfig, FeatureExtractor};
pub use classifier::{CheckpointRecorder, Classifier, ClassifierConfig};
pub use head::ClassificationHead;

/// File name training writes the checkpoint blob to
pub const CHECKPOINT_FILE: &str = "corn_classifier.bin";

/// File name of the [`ClassifierConfig`] saved next to a checkpoint
pub const CLASSIFIER_CONFIG_FILE: &str = "classifier_config.json";
