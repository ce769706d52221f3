//! Single-image tumor/normal prediction.

use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::ImageSize;
use crate::error::PredictionError;
use crate::ml::{load_and_rescale, BackendTask, CnnClassifier};
use crate::model::load_classifier;
use burn::tensor::backend::AutodiffBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnosis {
    Normal,
    Tumor,
}

impl Diagnosis {
    /// Class index 1 is `Tumor`, anything else `Normal`
    pub fn from_class_index(index: usize) -> Self {
        if index == 1 {
            Diagnosis::Tumor
        } else {
            Diagnosis::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Diagnosis::Normal => "Normal",
            Diagnosis::Tumor => "Tumor",
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can diagnose an image file
pub trait ImageClassifier: Send + Sync {
    fn predict(&self, image_path: &Path) -> Result<Diagnosis, PredictionError>;
}

/// Trained two-class classifier loaded once and reused for every request
pub struct PredictionPipeline<B: Backend> {
    model: Mutex<CnnClassifier<B>>,
    image_size: ImageSize,
    device: B::Device,
}

impl<B: Backend> PredictionPipeline<B> {
    pub fn load(model_path: &Path, device: B::Device) -> Result<Self, PredictionError> {
        let (metadata, model) = load_classifier::<B>(model_path, &device)?;
        let classes = metadata.num_classes.unwrap_or_default();
        if classes != 2 {
            return Err(PredictionError::NotBinary(classes));
        }

        let image_size = ImageSize {
            height: metadata.backbone.image_height,
            width: metadata.backbone.image_width,
            channels: 3,
        };
        tracing::info!(
            "Prediction model loaded from {} ({}x{} inputs, labels {:?})",
            model_path.display(),
            image_size.height,
            image_size.width,
            metadata.class_labels
        );

        Ok(Self {
            model: Mutex::new(model),
            image_size,
            device,
        })
    }

    pub fn image_size(&self) -> ImageSize {
        self.image_size
    }
}

impl<B: Backend> ImageClassifier for PredictionPipeline<B> {
    fn predict(&self, image_path: &Path) -> Result<Diagnosis, PredictionError> {
        let pixels = load_and_rescale(image_path, self.image_size)?;
        let ImageSize { height, width, .. } = self.image_size;
        let input = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device).reshape([1, 3, height, width]);

        let model = self
            .model
            .lock()
            .map_err(|e| PredictionError::Inference(e.to_string()))?;
        let probabilities = model.predict_proba(input);
        drop(model);

        let index = probabilities
            .argmax(1)
            .reshape([1])
            .into_scalar()
            .elem::<i64>();
        let diagnosis = Diagnosis::from_class_index(index as usize);
        tracing::info!("{} -> class {} ({})", image_path.display(), index, diagnosis);
        Ok(diagnosis)
    }
}

/// Load a [`PredictionPipeline`] on whichever backend the configuration selects
pub struct LoadClassifier {
    pub model_path: PathBuf,
}

impl BackendTask for LoadClassifier {
    type Output = Result<Arc<dyn ImageClassifier>, PredictionError>;

    fn run<B: AutodiffBackend>(self, device: B::Device) -> Self::Output {
        let pipeline = PredictionPipeline::<B::InnerBackend>::load(&self.model_path, device)?;
        Ok(Arc::new(pipeline))
    }
}
