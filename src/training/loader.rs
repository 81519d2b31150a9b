//! Index-backed batch loader
//!
//! Yields batches of preprocessed [`LeafItem`]s from a subset of a
//! [`DatasetIndex`]. Images are decoded lazily, one batch at a time, and any
//! load failure is surfaced to the caller instead of being skipped.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::{DatasetIndex, LeafItem, TransformPipeline};
use crate::utils::error::{DiagnosisError, Result};

/// Batch loader over a subset of a dataset index
#[derive(Debug, Clone)]
pub struct SampleLoader {
    index: Arc<DatasetIndex>,
    indices: Vec<usize>,
    transform: TransformPipeline,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl SampleLoader {
    /// Loader over the given sample positions of `index`
    pub fn new(
        index: Arc<DatasetIndex>,
        indices: Vec<usize>,
        transform: TransformPipeline,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(DiagnosisError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= index.len()) {
            return Err(DiagnosisError::Configuration(format!(
                "sample position {} is outside an index of {} samples",
                bad,
                index.len()
            )));
        }

        Ok(Self {
            index,
            indices,
            transform,
            batch_size,
            shuffle: false,
            seed: 0,
        })
    }

    /// Loader over every sample of `index`
    pub fn full(
        index: Arc<DatasetIndex>,
        transform: TransformPipeline,
        batch_size: usize,
    ) -> Result<Self> {
        let indices = (0..index.len()).collect();
        Self::new(index, indices, transform, batch_size)
    }

    /// Shuffle sample order every epoch, reproducibly from `seed`
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    pub fn index(&self) -> &DatasetIndex {
        &self.index
    }

    /// Sample positions in the order they are visited during `epoch`
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order = self.indices.clone();
        if self.shuffle {
            let mut rng = self.epoch_rng(epoch);
            order.shuffle(&mut rng);
        }
        order
    }

    /// Batches for one epoch
    pub fn batches(&self, epoch: usize) -> EpochBatches<'_> {
        let mut rng = self.epoch_rng(epoch);
        let mut order = self.indices.clone();
        if self.shuffle {
            order.shuffle(&mut rng);
        }

        EpochBatches {
            loader: self,
            order,
            position: 0,
            rng,
        }
    }

    fn epoch_rng(&self, epoch: usize) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64))
    }

    fn load_item(&self, position: usize, rng: &mut ChaCha8Rng) -> Result<LeafItem> {
        let sample = self.index.sample_at(position).ok_or_else(|| {
            DiagnosisError::Configuration(format!("no sample at position {}", position))
        })?;
        let image = self.index.load_image(sample)?;

        Ok(LeafItem {
            image: self.transform.apply(&image, rng),
            class_id: sample.class_id,
            path: sample.image_path.clone(),
        })
    }
}

/// Iterator over the batches of one epoch
pub struct EpochBatches<'a> {
    loader: &'a SampleLoader,
    order: Vec<usize>,
    position: usize,
    rng: ChaCha8Rng,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Vec<LeafItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }

        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let mut items = Vec::with_capacity(end - self.position);
        for &sample_position in &self.order[self.position..end] {
            match self.loader.load_item(sample_position, &mut self.rng) {
                Ok(item) => items.push(item),
                Err(e) => {
                    // Abort the epoch on the first failure
                    self.position = self.order.len();
                    return Some(Err(e));
                }
            }
        }
        self.position = end;

        Some(Ok(items))
    }
}
