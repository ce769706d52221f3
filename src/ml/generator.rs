//! Directory-backed image generators.
//!
//! A labeled image directory holds one subdirectory per class; class indices
//! follow the sorted subdirectory names. Datasets hold paths only and decode
//! images as burn's data loader asks for them.

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder, DataLoaderIterator},
        dataset::Dataset,
    },
    tensor::{backend::Backend, Int, Tensor},
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ImageSize;
use crate::error::ImageLoadError;
use crate::ml::augmentation::ImageAugmenter;
use crate::ml::image::{load_image, resize_to, to_chw};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Which part of a split directory a generator yields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    /// Everything except the per-class validation share
    Training,
    /// The first `floor(n * split)` files of each class
    Validation,
}

/// Image paths grouped by class
#[derive(Debug, Clone)]
pub struct ImageFolder {
    class_names: Vec<String>,
    /// Image paths per class, sorted
    files: Vec<Vec<PathBuf>>,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

impl ImageFolder {
    /// Scan `root` for class subdirectories and their image files
    pub fn scan(root: &Path) -> Result<Self, ImageLoadError> {
        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_dir() {
                class_dirs.push(path);
            }
        }
        class_dirs.sort();

        let mut class_names = Vec::with_capacity(class_dirs.len());
        let mut files = Vec::with_capacity(class_dirs.len());
        for dir in class_dirs {
            let mut images = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file() && is_image(&path) {
                    images.push(path);
                }
            }
            images.sort();

            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            class_names.push(name);
            files.push(images);
        }

        if files.iter().all(Vec::is_empty) {
            return Err(ImageLoadError::EmptyDirectory(root.to_path_buf()));
        }

        Ok(Self { class_names, files })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Total number of images
    pub fn len(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples of one subset; `split` is the validation fraction of each class
    pub fn subset(&self, split: f64, subset: Subset) -> Vec<(PathBuf, usize)> {
        let mut samples = Vec::new();
        for (label, images) in self.files.iter().enumerate() {
            let boundary = (images.len() as f64 * split).floor() as usize;
            let range = match subset {
                Subset::Validation => &images[..boundary],
                Subset::Training => &images[boundary..],
            };
            samples.extend(range.iter().map(|path| (path.clone(), label)));
        }
        samples
    }

    /// All samples
    pub fn all(&self) -> Vec<(PathBuf, usize)> {
        self.files
            .iter()
            .enumerate()
            .flat_map(|(label, images)| images.iter().map(move |path| (path.clone(), label)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub image_size: ImageSize,
    pub batch_size: usize,
    /// Reshuffle the sample order every epoch
    pub shuffle: bool,
    pub seed: u64,
}

/// Decoded, preprocessed sample
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// (C, H, W) pixels in [0, 1]
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// First decode failure seen by a dataset, shared with the generator that drains it
#[derive(Debug, Clone, Default)]
struct LoadFailure(Arc<Mutex<Option<ImageLoadError>>>);

impl LoadFailure {
    fn record(&self, err: ImageLoadError) {
        if let Ok(mut slot) = self.0.lock() {
            slot.get_or_insert(err);
        }
    }

    fn take(&self) -> Option<ImageLoadError> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Lazily decoding dataset over one subset of an [`ImageFolder`].
///
/// `get` returns `None` after a decode failure, which ends the loader's
/// epoch; the error itself is handed to [`DirectoryGenerator::batches`].
#[derive(Debug)]
pub struct ImageDataset {
    samples: Vec<(PathBuf, usize)>,
    image_size: ImageSize,
    augmenter: Option<ImageAugmenter>,
    seed: u64,
    /// Augmentation draws so far; seeds the rng of the next one
    draws: AtomicU64,
    failure: LoadFailure,
}

impl ImageDataset {
    pub fn new(samples: Vec<(PathBuf, usize)>, image_size: ImageSize) -> Self {
        Self {
            samples,
            image_size,
            augmenter: None,
            seed: 0,
            draws: AtomicU64::new(0),
            failure: LoadFailure::default(),
        }
    }

    pub fn with_augmenter(mut self, augmenter: ImageAugmenter, seed: u64) -> Self {
        self.augmenter = Some(augmenter);
        self.seed = seed;
        self
    }

    fn load(&self, path: &Path, label: usize) -> Result<ImageItem, ImageLoadError> {
        let mut img = resize_to(load_image(path)?, self.image_size);
        if let Some(augmenter) = &self.augmenter {
            let draw = self.draws.fetch_add(1, Ordering::Relaxed);
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(draw));
            img = augmenter.augment(&img, &mut rng);
        }
        Ok(ImageItem {
            pixels: to_chw(&img),
            label,
        })
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let (path, label) = self.samples.get(index)?;
        match self.load(path, *label) {
            Ok(item) => Some(item),
            Err(err) => {
                tracing::error!("Could not load {}: {}", path.display(), err);
                self.failure.record(err);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Batch loader over a labeled image directory
pub struct DirectoryGenerator<B: Backend> {
    loader: Arc<dyn DataLoader<B, ImageBatch<B>>>,
    failure: LoadFailure,
    class_names: Vec<String>,
    samples: usize,
    batch_size: usize,
}

impl<B: Backend> DirectoryGenerator<B> {
    /// Build a generator over `dir`.
    ///
    /// With `split = Some(fraction)` only the requested `subset` is used.
    pub fn flow_from_directory(
        dir: &Path,
        split: Option<f64>,
        subset: Subset,
        config: GeneratorConfig,
        augmenter: Option<ImageAugmenter>,
        device: &B::Device,
    ) -> Result<Self, ImageLoadError> {
        let folder = ImageFolder::scan(dir)?;
        let samples = match split {
            Some(fraction) => folder.subset(fraction, subset),
            None => folder.all(),
        };

        tracing::info!(
            "Found {} images belonging to {} classes in {}",
            samples.len(),
            folder.class_names().len(),
            dir.display()
        );

        let count = samples.len();
        let mut dataset = ImageDataset::new(samples, config.image_size);
        if let Some(augmenter) = augmenter {
            dataset = dataset.with_augmenter(augmenter, config.seed);
        }
        let failure = dataset.failure.clone();

        let mut builder = DataLoaderBuilder::<B, ImageItem, ImageBatch<B>>::new(ImageBatcher::new(config.image_size))
            .batch_size(config.batch_size)
            .num_workers(0)
            .set_device(device.clone());
        if config.shuffle {
            builder = builder.shuffle(config.seed);
        }

        Ok(Self {
            loader: builder.build(dataset),
            failure,
            class_names: folder.class_names,
            samples: count,
            batch_size: config.batch_size,
        })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Full batches per epoch (a trailing partial batch is not counted)
    pub fn steps_per_epoch(&self) -> usize {
        self.samples / self.batch_size
    }

    /// Batches needed to cover every sample once
    pub fn len(&self) -> usize {
        self.samples.div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Batches of the next epoch.
    ///
    /// A shuffling generator draws a new order on every call, reproducible
    /// from the configured seed.
    pub fn batches(&self) -> Batches<'_, B> {
        Batches {
            inner: self.loader.iter(),
            failure: &self.failure,
            done: false,
        }
    }
}

pub struct Batches<'a, B: Backend> {
    inner: Box<dyn DataLoaderIterator<ImageBatch<B>> + 'a>,
    failure: &'a LoadFailure,
    done: bool,
}

impl<B: Backend> Iterator for Batches<'_, B> {
    type Item = Result<ImageBatch<B>, ImageLoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let batch = self.inner.next();
        if let Some(err) = self.failure.take() {
            self.done = true;
            return Some(Err(err));
        }
        batch.map(Ok)
    }
}

/// Stacks decoded samples into tensors
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    image_size: ImageSize,
}

/// Batch data
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl ImageBatcher {
    pub fn new(image_size: ImageSize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let ImageSize { height, width, .. } = self.image_size;
        let mut pixels = Vec::with_capacity(batch_size * 3 * height * width);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            pixels.extend_from_slice(&item.pixels);
            targets.push(item.label as i64);
        }

        // one host-to-device transfer per batch
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), device)
            .reshape([batch_size, 3, height, width]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device);

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ml::augmentation::AugmentationConfig;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use image::{Rgb, RgbImage};

    pub const TINY: ImageSize = ImageSize {
        height: 32,
        width: 32,
        channels: 3,
    };

    /// `<root>/<class>/img_NNN.png` with `counts[i]` images per class
    pub fn write_image_folder(root: &Path, classes: &[(&str, usize)]) {
        for (class_index, (class, count)) in classes.iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let shade = (class_index * 200) as u8;
                RgbImage::from_pixel(40, 40, Rgb([shade, shade, shade]))
                    .save(dir.join(format!("img_{i:03}.png")))
                    .unwrap();
            }
        }
    }

    fn config(batch_size: usize, shuffle: bool) -> GeneratorConfig {
        GeneratorConfig {
            image_size: TINY,
            batch_size,
            shuffle,
            seed: 42,
        }
    }

    #[test]
    fn test_split_per_class() {
        let dir = tempfile::tempdir().unwrap();
        write_image_folder(dir.path(), &[("Tumor", 100), ("Normal", 100)]);

        let folder = ImageFolder::scan(dir.path()).unwrap();
        assert_eq!(folder.class_names(), ["Normal", "Tumor"]);
        assert_eq!(folder.len(), 200);

        let train = folder.subset(0.2, Subset::Training);
        let valid = folder.subset(0.2, Subset::Validation);
        assert_eq!(train.len(), 160);
        assert_eq!(valid.len(), 40);
        assert_eq!(valid.iter().filter(|(_, label)| *label == 1).count(), 20);
        assert!(valid[0].0.ends_with("Normal/img_000.png"));
        assert!(train.iter().all(|t| !valid.contains(t)));
    }

    #[test]
    fn test_odd_split_rounds_down() {
        let dir = tempfile::tempdir().unwrap();
        write_image_folder(dir.path(), &[("Normal", 7), ("Tumor", 3)]);
        let folder = ImageFolder::scan(dir.path()).unwrap();
        // floor(7 * 0.3) = 2, floor(3 * 0.3) = 0
        assert_eq!(folder.subset(0.3, Subset::Validation).len(), 2);
        assert_eq!(folder.subset(0.3, Subset::Training).len(), 8);
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Normal")).unwrap();
        assert!(matches!(
            ImageFolder::scan(dir.path()),
            Err(ImageLoadError::EmptyDirectory(_))
        ));
    }

    #[test]
    fn test_non_images_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_image_folder(dir.path(), &[("Normal", 2), ("Tumor", 2)]);
        std::fs::write(dir.path().join("Normal/notes.txt"), "x").unwrap();
        assert_eq!(ImageFolder::scan(dir.path()).unwrap().len(), 4);
    }

    fn labels(batch: &ImageBatch<NdArray>) -> Vec<i64> {
        batch.targets.to_data().iter::<i64>().collect()
    }

    #[test]
    fn test_steps_and_batches() {
        let dir = tempfile::tempdir().unwrap();
        write_image_folder(dir.path(), &[("Normal", 5), ("Tumor", 5)]);

        let generator = DirectoryGenerator::<NdArray>::flow_from_directory(
            dir.path(),
            None,
            Subset::Training,
            config(4, false),
            None,
            &NdArrayDevice::Cpu,
        )
        .unwrap();
        assert_eq!(generator.samples(), 10);
        assert_eq!(generator.steps_per_epoch(), 2);
        assert_eq!(generator.len(), 3);

        let batches: Vec<_> = generator.batches().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].images.dims(), [4, 3, 32, 32]);
        assert_eq!(batches[2].images.dims(), [2, 3, 32, 32]);
        assert_eq!(labels(&batches[0])[0], 0);
        assert_eq!(labels(&batches[2]), [1, 1]);
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        write_image_folder(dir.path(), &[("Normal", 8), ("Tumor", 8)]);
        let generator = || {
            DirectoryGenerator::<NdArray>::flow_from_directory(
                dir.path(),
                None,
                Subset::Training,
                config(16, true),
                None,
                &NdArrayDevice::Cpu,
            )
            .unwrap()
        };

        let first = generator();
        let second = generator();
        let epoch = |g: &DirectoryGenerator<NdArray>| labels(&g.batches().next().unwrap().unwrap());
        let order = epoch(&first);
        assert_eq!(order, epoch(&second));
        assert_eq!(order.len(), 16);
        assert_eq!(order.iter().filter(|&&label| label == 1).count(), 8);
    }

    #[test]
    fn test_corrupt_image_ends_epoch_with_error() {
        let dir = tempfile::tempdir().unwrap();
        write_image_folder(dir.path(), &[("Normal", 4), ("Tumor", 4)]);
        std::fs::write(dir.path().join("Tumor/img_001.png"), b"truncated").unwrap();

        let generator = DirectoryGenerator::<NdArray>::flow_from_directory(
            dir.path(),
            None,
            Subset::Training,
            config(4, false),
            None,
            &NdArrayDevice::Cpu,
        )
        .unwrap();

        let results: Vec<_> = generator.batches().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ImageLoadError::Decode { .. })));

        // the failure is reported once; the next epoch starts clean
        let next = generator.batches().next().unwrap();
        assert!(next.is_ok());
    }

    #[test]
    fn test_augmented_dataset_keeps_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_image_folder(dir.path(), &[("Normal", 2), ("Tumor", 2)]);
        let folder = ImageFolder::scan(dir.path()).unwrap();

        let dataset = ImageDataset::new(folder.all(), TINY)
            .with_augmenter(ImageAugmenter::new(AugmentationConfig::default()), 7);
        assert_eq!(dataset.len(), 4);
        let item = dataset.get(3).unwrap();
        assert_eq!(item.label, 1);
        assert_eq!(item.pixels.len(), 3 * 32 * 32);
        assert!(dataset.get(4).is_none());
    }

    #[test]
    fn test_batcher_shapes() {
        let device = NdArrayDevice::Cpu;
        let items = vec![
            ImageItem {
                pixels: vec![0.5; 3 * 32 * 32],
                label: 1,
            };
            3
        ];
        let batch: ImageBatch<NdArray> = ImageBatcher::new(TINY).batch(items, &device);
        assert_eq!(batch.images.dims(), [3, 3, 32, 32]);
        assert_eq!(batch.targets.dims(), [3]);
    }
}
