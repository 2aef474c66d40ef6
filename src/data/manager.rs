//! Example discovery, train/test split and batching
//!
//! Examples are image files in one flat directory. The label of an example is
//! the part of its file name before the first underscore, so
//! `hello_0001.png` is an image of the word `hello`.

use std::path::{Path, PathBuf};

use ndarray::{Array4, Axis};
use tracing::{info, warn};

use super::codec::LabelCodec;
use super::preprocessing::load_image;
use super::sparse::SparseTarget;
use crate::error::{Error, Result};

/// One batch of examples
#[derive(Debug, Clone)]
pub struct Batch {
    /// Label strings, one per example
    pub ground_truth: Vec<String>,
    /// Encoded labels
    pub targets: SparseTarget,
    /// `[batch, width, 32, 1]` images
    pub images: Array4<f32>,
}

impl Batch {
    /// Number of examples in the batch
    pub fn len(&self) -> usize {
        self.ground_truth.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ground_truth.is_empty()
    }
}

/// Replayable source of training and test batches
pub trait BatchSource {
    /// Examples per full batch
    fn batch_size(&self) -> usize;

    /// Training batches, all of `batch_size` examples
    fn train_batches(&self) -> &[Batch];

    /// Test batches; the last one may be smaller
    fn test_batches(&self) -> &[Batch];
}

struct Example {
    label: String,
    target: Vec<u32>,
    image: ndarray::Array3<f32>,
}

/// Settings for [`DataManager::load`]
#[derive(Debug, Clone)]
pub struct DataManagerConfig {
    /// Directory holding the example images
    pub examples_path: PathBuf,
    /// Examples per batch
    pub batch_size: usize,
    /// Fraction of examples used for training
    pub train_test_ratio: f64,
    /// Width every image is fitted to
    pub max_image_width: usize,
    /// Longest label the model can emit
    pub max_char_count: usize,
}

/// In-memory example set split into training and test batches
pub struct DataManager {
    batch_size: usize,
    train_batches: Vec<Batch>,
    test_batches: Vec<Batch>,
}

/// Label encoded in an example's file name
pub fn label_from_file_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let label = name.split('_').next()?;
    if label.is_empty() || label == name {
        return None;
    }
    Some(label.to_string())
}

impl DataManager {
    /// Read every example under `config.examples_path` and batch it
    pub fn load(config: &DataManagerConfig, codec: &LabelCodec) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("Batch size must be > 0"));
        }
        if !(0.0..=1.0).contains(&config.train_test_ratio) {
            return Err(Error::config(format!(
                "Train/test ratio must be within [0, 1], got {}",
                config.train_test_ratio
            )));
        }

        let examples = Self::load_examples(config, codec)?;
        info!(
            "Loaded {} examples from {}",
            examples.len(),
            config.examples_path.display()
        );

        let test_offset = (config.train_test_ratio * examples.len() as f64).floor() as usize;
        let (train, test) = examples.split_at(test_offset.min(examples.len()));

        let train_batches = train
            .chunks_exact(config.batch_size)
            .map(make_batch)
            .collect::<Result<Vec<_>>>()?;
        let test_batches = test
            .chunks(config.batch_size)
            .map(make_batch)
            .collect::<Result<Vec<_>>>()?;

        info!(
            "{} training batches, {} test batches of up to {} examples",
            train_batches.len(),
            test_batches.len(),
            config.batch_size
        );

        Ok(Self {
            batch_size: config.batch_size,
            train_batches,
            test_batches,
        })
    }

    fn load_examples(config: &DataManagerConfig, codec: &LabelCodec) -> Result<Vec<Example>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&config.examples_path)
            .map_err(|e| {
                Error::data(format!(
                    "Cannot read examples directory {}: {e}",
                    config.examples_path.display()
                ))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut examples = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(label) = label_from_file_name(&path) else {
                warn!("Skipping {}: no label prefix in file name", path.display());
                continue;
            };
            if label.chars().count() > config.max_char_count {
                warn!(
                    "Skipping {}: label longer than {} characters",
                    path.display(),
                    config.max_char_count
                );
                continue;
            }
            let target = match codec.encode(&label) {
                Ok(target) => target,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if crate::ctc::required_steps(&target) > config.max_char_count {
                warn!(
                    "Skipping {}: repeated characters need more than {} timesteps",
                    path.display(),
                    config.max_char_count
                );
                continue;
            }
            match load_image(&path, config.max_image_width) {
                Ok(image) => examples.push(Example { label, target, image }),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(examples)
    }

    /// Build a source directly from batches
    pub fn from_batches(batch_size: usize, train_batches: Vec<Batch>, test_batches: Vec<Batch>) -> Self {
        Self {
            batch_size,
            train_batches,
            test_batches,
        }
    }
}

fn make_batch(examples: &[Example]) -> Result<Batch> {
    let views: Vec<_> = examples.iter().map(|e| e.image.view()).collect();
    let images = ndarray::stack(Axis(0), &views)?;
    let targets: Vec<Vec<u32>> = examples.iter().map(|e| e.target.clone()).collect();

    Ok(Batch {
        ground_truth: examples.iter().map(|e| e.label.clone()).collect(),
        targets: SparseTarget::from_sequences(&targets),
        images,
    })
}

impl BatchSource for DataManager {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn train_batches(&self) -> &[Batch] {
        &self.train_batches
    }

    fn test_batches(&self) -> &[Batch] {
        &self.test_batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_examples(dir: &Path, labels: &[&str]) {
        for (i, label) in labels.iter().enumerate() {
            let path = dir.join(format!("{label}_{i:04}.png"));
            GrayImage::from_pixel(24, 32, Luma([200])).save(path).unwrap();
        }
    }

    fn config(dir: &Path, batch_size: usize, ratio: f64) -> DataManagerConfig {
        DataManagerConfig {
            examples_path: dir.to_path_buf(),
            batch_size,
            train_test_ratio: ratio,
            max_image_width: 32,
            max_char_count: 7,
        }
    }

    #[test]
    fn test_label_from_file_name() {
        assert_eq!(
            label_from_file_name(Path::new("/x/hello_0001.png")).as_deref(),
            Some("hello")
        );
        assert_eq!(label_from_file_name(Path::new("noprefix.png")), None);
        assert_eq!(label_from_file_name(Path::new("_1.png")), None);
    }

    #[test]
    fn test_split_and_batching() {
        let dir = tempfile::tempdir().unwrap();
        write_examples(dir.path(), &["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);

        let manager = DataManager::load(&config(dir.path(), 3, 0.7), &LabelCodec::default()).unwrap();
        // 7 training examples -> 2 full batches; 3 test examples -> 1 batch
        assert_eq!(manager.train_batches().len(), 2);
        assert_eq!(manager.test_batches().len(), 1);
        assert_eq!(manager.train_batches()[0].ground_truth, vec!["a", "b", "c"]);
        assert_eq!(manager.test_batches()[0].ground_truth, vec!["h", "i", "j"]);
        assert_eq!(manager.train_batches()[0].images.dim(), (3, 32, 32, 1));
        assert_eq!(manager.batch_size(), 3);
    }

    #[test]
    fn test_ratio_zero_keeps_partial_test_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_examples(dir.path(), &["ab", "cd", "ef", "gh", "ij"]);

        let manager = DataManager::load(&config(dir.path(), 2, 0.0), &LabelCodec::default()).unwrap();
        assert!(manager.train_batches().is_empty());
        let sizes: Vec<usize> = manager.test_batches().iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_skips_unusable_examples() {
        let dir = tempfile::tempdir().unwrap();
        write_examples(dir.path(), &["ok", "waytoolongword", "UPPER", "aa"]);
        std::fs::write(dir.path().join("broken_1.png"), b"not an image").unwrap();

        let manager = DataManager::load(&config(dir.path(), 1, 1.0), &LabelCodec::default()).unwrap();
        let labels: Vec<String> = manager
            .train_batches()
            .iter()
            .flat_map(|b| b.ground_truth.clone())
            .collect();
        assert_eq!(labels, vec!["aa", "ok"]);
    }

    #[test]
    fn test_invalid_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let result = DataManager::load(&config(dir.path(), 2, 1.5), &LabelCodec::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
