//! Burn batching for preprocessed leaf images

use std::path::PathBuf;

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::TensorData,
};

use crate::dataset::transform::ImageTensor;

/// One preprocessed training/evaluation example
#[derive(Clone, Debug)]
pub struct LeafItem {
    /// Normalized CHW image
    pub image: ImageTensor,
    pub class_id: usize,
    pub path: PathBuf,
}

/// A batch of leaf images
#[derive(Clone, Debug)]
pub struct LeafBatch<B: Backend> {
    /// Images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Class ids with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// Stacks preprocessed items into device tensors.
///
/// Items are already normalized by the transform pipeline, so batching is a
/// plain concatenation.
#[derive(Clone, Debug, Default)]
pub struct LeafBatcher;

impl<B: Backend> Batcher<B, LeafItem, LeafBatch<B>> for LeafBatcher {
    fn batch(&self, items: Vec<LeafItem>, device: &B::Device) -> LeafBatch<B> {
        let batch_size = items.len();
        let [channels, height, width] = items
            .first()
            .map(|item| item.image.shape())
            .unwrap_or([3, 0, 0]);

        let images_data: Vec<f32> = items
            .iter()
            .flat_map(|item| item.image.data.iter().copied())
            .collect();

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );

        let targets_data: Vec<i64> = items.iter().map(|item| item.class_id as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets_data, [batch_size]),
            device,
        );

        LeafBatch { images, targets }
    }
}
