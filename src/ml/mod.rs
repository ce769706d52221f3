pub mod augmentation;
pub mod backend;
pub mod generator;
pub mod image;
pub mod metrics;
pub mod vgg;

pub use augmentation::{AugmentationConfig, ImageAugmenter};
pub use backend::{dispatch, BackendTask, CpuBackend};
pub use generator::{
    Batches, DirectoryGenerator, GeneratorConfig, ImageBatch, ImageBatcher, ImageDataset, ImageFolder, ImageItem, Subset,
};
pub use image::load_and_rescale;
pub use metrics::{correct_predictions, evaluate_generator, RunningScore};
pub use vgg::{BackboneConfig, ClassifierConfig, CnnClassifier, FreezePolicy, LayerSummary, Vgg16};
