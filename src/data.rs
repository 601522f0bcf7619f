use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::{transform::MapperDataset, Dataset, InMemDataset},
    },
    prelude::*,
};
use image::RgbImage;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::{
    augment::{AugmentConfig, Augmenter},
    error::{ErrorKind, Tagged},
    preprocess::{self, IMAGE_SIZE},
};

pub const BATCH_SIZE: usize = 32;

/// Binary label mode: exactly two class directories.
pub const CLASS_COUNT: usize = 2;

#[derive(Debug, Clone)]
pub struct ImageItem {
    pub image: RgbImage,
    pub label: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Augmented and reshuffled every epoch.
    Training,
    /// Rescaled only, read in directory order.
    Validation,
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("failed to read {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("expected {CLASS_COUNT} class directories under {path}, found {found}")]
    ClassCount { path: PathBuf, found: usize },
    #[error("no readable images under {0}")]
    Empty(PathBuf),
}

impl Tagged for DatasetError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::NotFound
    }
}

/// Labeled images loaded from a directory tree of one subdirectory per class.
#[derive(Clone)]
pub struct DatasetHandle {
    pub root: PathBuf,
    pub split: Split,
    /// Class directory names, index = label.
    pub classes: Vec<String>,
    items: Arc<InMemDataset<ImageItem>>,
    augmentation: AugmentConfig,
}

impl fmt::Debug for DatasetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetHandle")
            .field("root", &self.root)
            .field("split", &self.split)
            .field("classes", &self.classes)
            .field("len", &self.len())
            .finish()
    }
}

impl DatasetHandle {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn batch_count(&self) -> usize {
        self.len().div_ceil(BATCH_SIZE)
    }

    pub fn class_counts(&self) -> [usize; CLASS_COUNT] {
        let mut counts = [0; CLASS_COUNT];
        for item in self.items.iter() {
            counts[item.label as usize] += 1;
        }
        counts
    }

    /// Batches as the network consumes them. Training data is augmented,
    /// shuffled with `seed` and spread over `workers` threads; validation data
    /// is read on the calling thread in a fixed order.
    pub fn dataloader<B: Backend>(
        &self,
        device: &B::Device,
        seed: u64,
        workers: usize,
    ) -> Arc<dyn DataLoader<ImageBatch<B>>> {
        let builder = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone()))
            .batch_size(BATCH_SIZE);

        match self.split {
            Split::Training => {
                let dataset = MapperDataset::<_, _, ImageItem>::new(
                    self.items.clone(),
                    Augmenter::new(self.augmentation.clone()),
                );
                let builder = builder.shuffle(seed);
                if workers > 1 {
                    builder.num_workers(workers).build(dataset)
                } else {
                    builder.build(dataset)
                }
            }
            Split::Validation => builder.build(self.items.clone()),
        }
    }
}

/// Scan `root` for class subdirectories and decode every image in them.
pub fn load_directory(root: &Path, split: Split) -> Result<DatasetHandle, DatasetError> {
    if !root.is_dir() {
        return Err(DatasetError::MissingDirectory(root.to_path_buf()));
    }

    let classes = class_directories(root)?;
    if classes.len() != CLASS_COUNT {
        return Err(DatasetError::ClassCount {
            path: root.to_path_buf(),
            found: classes.len(),
        });
    }

    let mut files = Vec::new();
    for (label, class) in classes.iter().enumerate() {
        let dir = root.join(class);
        let mut paths = fs::read_dir(&dir)
            .map_err(|source| DatasetError::ReadDir {
                path: dir.clone(),
                source,
            })?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && preprocess::has_image_extension(path))
            .collect::<Vec<_>>();
        paths.sort();
        files.extend(paths.into_iter().map(|path| (path, label as u8)));
    }

    let items: Vec<ImageItem> = files
        .par_iter()
        .filter_map(|(path, label)| match preprocess::load_image(path) {
            Ok(image) => Some(ImageItem {
                image,
                label: *label,
            }),
            Err(err) => {
                tracing::warn!("Skipping {}: {err}", path.display());
                None
            }
        })
        .collect();

    if items.is_empty() {
        return Err(DatasetError::Empty(root.to_path_buf()));
    }

    tracing::info!(
        "Found {} images belonging to {} classes in {} ({:?})",
        items.len(),
        classes.len(),
        root.display(),
        split
    );

    Ok(DatasetHandle {
        root: root.to_path_buf(),
        split,
        classes,
        items: Arc::new(InMemDataset::new(items)),
        augmentation: AugmentConfig::default(),
    })
}

fn class_directories(root: &Path) -> Result<Vec<String>, DatasetError> {
    let mut classes = fs::read_dir(root)
        .map_err(|source| DatasetError::ReadDir {
            path: root.to_path_buf(),
            source,
        })?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
        .filter(|name| !name.starts_with('.'))
        .collect::<Vec<_>>();
    classes.sort();
    Ok(classes)
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[batch, 3, 128, 128]`, values in [0, 1].
    pub images: Tensor<B, 4>,
    /// `[batch, 1]` with 0 or 1.
    pub targets: Tensor<B, 2, Int>,
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let images = items
            .iter()
            .map(|item| preprocess::to_array(&item.image))
            .map(|array| preprocess::to_tensor::<B>(&array, &self.device))
            .map(|tensor| tensor.reshape([1, 3, IMAGE_SIZE, IMAGE_SIZE]))
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    &self.device,
                )
            })
            .collect();

        let images = Tensor::cat(images, 0).to_device(&self.device);
        let targets = Tensor::cat(targets, 0)
            .reshape([items.len(), 1])
            .to_device(&self.device);

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn write_images(dir: &Path, count: usize, color: [u8; 3]) {
        fs::create_dir_all(dir).unwrap();
        for idx in 0..count {
            RgbImage::from_pixel(40, 30, Rgb(color))
                .save(dir.join(format!("img_{idx:03}.png")))
                .unwrap();
        }
    }

    #[test]
    fn batch_count_rounds_up_per_split() {
        let root = tempdir().unwrap();
        write_images(&root.path().join("cats"), 20, [10, 10, 10]);
        write_images(&root.path().join("dogs"), 15, [200, 200, 200]);
        fs::write(root.path().join("cats").join("README.txt"), "ignored").unwrap();

        let handle = load_directory(root.path(), Split::Validation).unwrap();
        assert_eq!(handle.len(), 35);
        assert_eq!(handle.batch_count(), 2);
        assert_eq!(handle.classes, vec!["cats".to_string(), "dogs".to_string()]);
        assert_eq!(handle.class_counts(), [20, 15]);

        let device = Default::default();
        let loader = handle.dataloader::<TestBackend>(&device, 0, 1);
        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].images.dims(), [32, 3, 128, 128]);
        assert_eq!(batches[1].images.dims(), [3, 3, 128, 128]);
        assert_eq!(batches[1].targets.dims(), [3, 1]);

        let max: f32 = batches[0].images.clone().max().into_scalar();
        let min: f32 = batches[0].images.clone().min().into_scalar();
        assert!(max <= 1.0 && min >= 0.0);
    }

    #[test]
    fn validation_labels_follow_class_order() {
        let root = tempdir().unwrap();
        write_images(&root.path().join("cats"), 2, [0, 0, 0]);
        write_images(&root.path().join("dogs"), 2, [255, 255, 255]);

        let handle = load_directory(root.path(), Split::Validation).unwrap();
        let device = Default::default();
        let batch = handle.dataloader::<TestBackend>(&device, 0, 1).iter().next().unwrap();
        let labels: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(labels, vec![0, 0, 1, 1]);
    }

    #[test]
    fn training_split_yields_augmented_batches() {
        let root = tempdir().unwrap();
        write_images(&root.path().join("cats"), 3, [30, 60, 90]);
        write_images(&root.path().join("dogs"), 3, [90, 60, 30]);

        let handle = load_directory(root.path(), Split::Training).unwrap();
        let device = Default::default();
        let batches: Vec<_> = handle.dataloader::<TestBackend>(&device, 1, 2).iter().collect();
        let total: usize = batches.iter().map(|batch| batch.images.dims()[0]).sum();
        assert_eq!(total, 6);

        for batch in batches {
            let [n, channels, height, width] = batch.images.dims();
            assert_eq!([channels, height, width], [3, 128, 128]);
            assert_eq!(batch.targets.dims(), [n, 1]);

            let max: f32 = batch.images.clone().max().into_scalar();
            let min: f32 = batch.images.min().into_scalar();
            assert!((0.0..=1.0).contains(&min) && (0.0..=1.0).contains(&max));
        }
    }

    #[test]
    fn debug_output_summarizes_items() {
        let root = tempdir().unwrap();
        write_images(&root.path().join("cats"), 2, [0, 0, 0]);
        write_images(&root.path().join("dogs"), 1, [255, 255, 255]);

        let handle = load_directory(root.path(), Split::Validation).unwrap();
        let debug = format!("{handle:?}");
        assert!(debug.starts_with("DatasetHandle"));
        assert!(debug.contains("len: 3"));
        assert!(debug.contains("Validation"));
    }

    #[test]
    fn missing_directory_is_not_found() {
        let root = tempdir().unwrap();
        let err = load_directory(&root.path().join("absent"), Split::Training).unwrap_err();
        assert!(matches!(err, DatasetError::MissingDirectory(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn single_class_is_rejected() {
        let root = tempdir().unwrap();
        write_images(&root.path().join("cats"), 2, [0, 0, 0]);
        let err = load_directory(root.path(), Split::Training).unwrap_err();
        assert!(matches!(err, DatasetError::ClassCount { found: 1, .. }));
    }

    #[test]
    fn directories_without_images_are_rejected() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("cats")).unwrap();
        fs::create_dir_all(root.path().join("dogs")).unwrap();
        let err = load_directory(root.path(), Split::Validation).unwrap_err();
        assert!(matches!(err, DatasetError::Empty(_)));
    }
}
