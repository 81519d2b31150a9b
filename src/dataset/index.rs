//! Dataset index
//!
//! Scans a `root/<ClassName>/<Variant>/*.{png,jpg,jpeg}` tree into an ordered
//! list of samples. Image bytes are not loaded here; they are read lazily by
//! whoever consumes a sample.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::utils::error::{DiagnosisError, Result};

/// File extensions accepted as images (compared case-insensitively)
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Default variant subdirectories: raw color photos and segmented leaves
pub const DEFAULT_VARIANTS: [&str; 2] = ["Color", "Segment"];

/// A single labeled image on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Path to the image file
    pub image_path: PathBuf,
    /// Class id, in `[0, num_classes)`
    pub class_id: usize,
}

/// Ordered, read-only collection of samples plus the class-name mapping
#[derive(Debug, Clone)]
pub struct DatasetIndex {
    root: PathBuf,
    samples: Vec<Sample>,
    class_to_id: BTreeMap<String, usize>,
    class_names: Vec<String>,
}

impl DatasetIndex {
    /// Scan `root` for class directories and their accepted variant subdirectories.
    ///
    /// Class ids follow the byte-wise order of the class directory names.
    /// Variant subdirectories that do not exist are skipped. Files inside a
    /// variant directory are taken in file-name order.
    pub fn build<P, S>(root: P, accepted_variants: &[S]) -> Result<Self>
    where
        P: AsRef<Path>,
        S: AsRef<str>,
    {
        let root = root.as_ref().to_path_buf();
        info!("Indexing dataset at {:?}", root);

        let entries = std::fs::read_dir(&root).map_err(|source| DiagnosisError::Filesystem {
            path: root.clone(),
            source,
        })?;

        let mut class_names: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DiagnosisError::Filesystem {
                path: root.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => class_names.push(name),
                Err(name) => warn!("Skipping class directory with non-UTF-8 name {:?}", name),
            }
        }
        // String ordering is byte-wise, independent of locale
        class_names.sort();

        let class_to_id: BTreeMap<String, usize> = class_names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();

        let mut samples = Vec::new();
        for (class_id, class_name) in class_names.iter().enumerate() {
            let before = samples.len();

            for variant in accepted_variants {
                let variant_dir = root.join(class_name).join(variant.as_ref());
                if !variant_dir.is_dir() {
                    debug!("No '{}' variant for class '{}'", variant.as_ref(), class_name);
                    continue;
                }

                for entry in WalkDir::new(&variant_dir)
                    .min_depth(1)
                    .max_depth(1)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if entry.file_type().is_file() && is_image_file(entry.path()) {
                        samples.push(Sample {
                            image_path: entry.path().to_path_buf(),
                            class_id,
                        });
                    }
                }
            }

            debug!(
                "Class '{}' (id {}): {} samples",
                class_name,
                class_id,
                samples.len() - before
            );
        }

        info!(
            "Indexed {} samples across {} classes",
            samples.len(),
            class_names.len()
        );

        Ok(Self {
            root,
            samples,
            class_to_id,
            class_names,
        })
    }

    /// Root directory the index was built from
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_at(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Class name to class id mapping used to label the samples
    pub fn class_name_map(&self) -> &BTreeMap<String, usize> {
        &self.class_to_id
    }

    /// Class names ordered by class id
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Number of samples per class id
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_classes()];
        for sample in &self.samples {
            counts[sample.class_id] += 1;
        }
        counts
    }

    /// Load the pixels of a sample, converted to 3-channel RGB
    pub fn load_image(&self, sample: &Sample) -> Result<RgbImage> {
        let image = ImageReader::open(&sample.image_path)
            .map_err(|e| DiagnosisError::ImageLoad(sample.image_path.clone(), e.to_string()))?
            .with_guessed_format()
            .map_err(|e| DiagnosisError::ImageLoad(sample.image_path.clone(), e.to_string()))?
            .decode()
            .map_err(|e| DiagnosisError::ImageLoad(sample.image_path.clone(), e.to_string()))?;

        Ok(image.to_rgb8())
    }

    /// Split sample indices into (train, validation), per class.
    ///
    /// Each class contributes `round(count * validation_fraction)` samples to
    /// the validation set. The split is deterministic for a given seed and both
    /// index lists are returned in ascending order.
    pub fn stratified_split(
        &self,
        validation_fraction: f64,
        seed: u64,
    ) -> Result<(Vec<usize>, Vec<usize>)> {
        if !(0.0..1.0).contains(&validation_fraction) {
            return Err(DiagnosisError::Configuration(format!(
                "validation fraction must be in [0, 1), got {}",
                validation_fraction
            )));
        }

        let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); self.num_classes()];
        for (index, sample) in self.samples.iter().enumerate() {
            by_class[sample.class_id].push(index);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut validation = Vec::new();

        for mut indices in by_class {
            indices.shuffle(&mut rng);
            let n_val = ((indices.len() as f64 * validation_fraction).round() as usize)
                .min(indices.len());
            validation.extend_from_slice(&indices[..n_val]);
            train.extend_from_slice(&indices[n_val..]);
        }

        train.sort_unstable();
        validation.sort_unstable();

        info!(
            "Stratified split: {} train / {} validation",
            train.len(),
            validation.len()
        );

        Ok((train, validation))
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
