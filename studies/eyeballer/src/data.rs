use anyhow::{ bail, Context, Result };
use burn::prelude::Backend;
use burn::tensor::{ Tensor, TensorData };
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::fs::read_dir;
use std::path::{ Path, PathBuf };
use tracing::{ debug, info, warn };

use crate::utils::images::{ is_image_file, load_image_and_resize224 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
}

/// One labeled image of the directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    /// `<class>/<file>`, relative to the dataset root
    pub filename: PathBuf,
    pub label: i64,
}

pub struct Dataset {
    root: PathBuf,
    subset: Subset,
    samples: Vec<Sample>,
    classes: Vec<String>,
}

impl Dataset {
    /// Walks `root/<class>/`, nested folders included, and keeps the files belonging
    /// to `subset`. Exactly two class directories are expected.
    ///
    /// Classes are indexed in name order. Inside each class, files are sorted by name and the
    /// first `floor(validation_split * n)` of them form the validation subset, so the two
    /// subsets are disjoint and stable across runs.
    pub fn new<T: AsRef<Path>>(root: T, subset: Subset, validation_split: f64) -> Result<Dataset> {
        let root = root.as_ref();
        let classes = Self::get_classes(root)?;
        if classes.len() != 2 {
            bail!(
                "a binary classifier needs exactly 2 class directories in {}, found {}: {:?}",
                root.display(),
                classes.len(),
                classes
            );
        }

        let mut samples = Vec::new();
        for (class_id, class) in classes.iter().enumerate() {
            let files = Self::get_images_in_folder(&root.join(class))?;
            let split = ((files.len() as f64) * validation_split) as usize;
            let files = match subset {
                Subset::Validation => &files[..split],
                Subset::Training => &files[split..],
            };

            samples.extend(
                files.iter().map(|file| Sample {
                    path: root.join(class).join(file),
                    filename: Path::new(class).join(file),
                    label: class_id as i64,
                })
            );
        }

        Ok(Dataset {
            root: root.to_path_buf(),
            subset,
            samples,
            classes,
        })
    }

    /// Subdirectories of the root, sorted by name
    fn get_classes(dir: &Path) -> Result<Vec<String>> {
        let mut classes = Vec::new();
        let entries = read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    classes.push(name.to_string());
                }
            }
        }
        if classes.is_empty() {
            bail!("no class directories found in {}", dir.display());
        }
        classes.sort();
        Ok(classes)
    }

    /// Image files below one class folder, relative to it and sorted
    fn get_images_in_folder(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        Self::collect_images(dir, Path::new(""), &mut files)?;
        files.sort();
        Ok(files)
    }

    fn collect_images(dir: &Path, prefix: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
        let entries = read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name() else {
                continue;
            };
            if path.is_dir() {
                Self::collect_images(&path, &prefix.join(name), files)?;
            } else if is_image_file(&path) {
                files.push(prefix.join(name));
            }
        }
        Ok(())
    }

    pub fn print(&self) {
        info!("DATASET ({}) {:?}", self.root.display(), self.subset);
        info!("Classes: {:?}", self.classes);
        info!("Size: {}", self.samples.len());
        if self.is_empty() {
            warn!("{:?} subset of {} is empty", self.subset, self.root.display());
        }
        debug!("Sample of data {:?}", &self.samples[..self.samples.len().min(2)]);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    fn get_item<B: Backend>(
        &self,
        idx: usize,
        device: &B::Device,
        augmentation: bool
    ) -> Result<(Tensor<B, 3>, i64)> {
        let sample = &self.samples[idx];
        let tensor = load_image_and_resize224(&sample.path, device, augmentation)?;
        Ok((tensor, sample.label))
    }
}

/// Images `[batch, 224, 224, 3]`, labels `[batch, 1]` and the dataset index of every row.
pub struct Batch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 2>,
    pub indices: Vec<usize>,
}

pub struct DataLoader<B: Backend> {
    dataset: Dataset,
    batch_size: usize,
    batch_index: usize,
    order: Vec<usize>,
    shuffle: bool,
    augmentation: bool,
    device: B::Device,
}

impl<B: Backend> DataLoader<B> {
    pub fn new(
        dataset: Dataset,
        batch_size: usize,
        shuffle: bool,
        augmentation: bool,
        device: B::Device
    ) -> DataLoader<B> {
        let order = (0..dataset.len()).collect();
        DataLoader {
            dataset,
            batch_size,
            batch_index: 0,
            order,
            shuffle,
            augmentation,
            device,
        }
    }

    fn shuffle_dataset(&mut self) {
        let mut rng = thread_rng();
        self.order.shuffle(&mut rng)
    }

    /// Total number of images in the dataset
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    /// Number of batches, counting a trailing partial batch
    pub fn len_batch(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Number of full batches; zero when the subset is smaller than one batch
    pub fn steps(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    /// Restart from the first batch. The next batch reshuffles a shuffling loader.
    pub fn reset(&mut self) {
        self.batch_index = 0;
    }

    pub fn sample(&self, idx: usize) -> &Sample {
        &self.dataset.samples()[idx]
    }

    pub fn get_classes(&self) -> &[String] {
        self.dataset.classes()
    }

    fn load_batch(&self, start: usize, end: usize) -> Result<Batch<B>> {
        let indices = self.order[start..end].to_vec();
        let mut images: Vec<Tensor<B, 3>> = Vec::with_capacity(indices.len());
        let mut labels: Vec<f32> = Vec::with_capacity(indices.len());

        for &i in &indices {
            let (image_t, label) = self.dataset.get_item::<B>(i, &self.device, self.augmentation)?;
            images.push(image_t);
            labels.push(label as f32);
        }

        let rows = labels.len();
        Ok(Batch {
            images: Tensor::stack(images, 0),
            labels: Tensor::from_data(TensorData::new(labels, [rows, 1]), &self.device),
            indices,
        })
    }
}

/// Batches of one epoch. Returns `None` once the subset is exhausted and rewinds.
impl<B: Backend> Iterator for DataLoader<B> {
    type Item = Result<Batch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.batch_index * self.batch_size;
        if start >= self.dataset.len() {
            self.batch_index = 0;
            return None;
        }
        let end = (start + self.batch_size).min(self.dataset.len());
        if self.batch_index == 0 && self.shuffle {
            self.shuffle_dataset();
        }

        self.batch_index += 1;
        Some(self.load_batch(start, end))
    }
}
