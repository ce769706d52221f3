//! Per-stage configuration records.
//!
//! Each stage receives one immutable struct holding exactly what it needs,
//! resolved from the structural config and the hyperparameters.

use std::path::PathBuf;

use crate::config::settings::{ImageSize, Params};
use crate::ml::FreezePolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataIngestionConfig {
    pub root_dir: PathBuf,
    pub source_url: String,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

/// Where the backbone weights come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    /// Random initialisation
    Random,
    /// Converted ImageNet weights, if the bundle exists
    Imagenet { bundle: PathBuf },
    /// Any backbone bundle
    File(PathBuf),
}

impl WeightSource {
    /// Parse the `WEIGHTS` parameter
    pub fn from_param(value: Option<&str>, imagenet_bundle: PathBuf) -> Self {
        match value.map(str::trim) {
            None | Some("") => WeightSource::Random,
            Some(v) if v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("random") => {
                WeightSource::Random
            }
            Some(v) if v.eq_ignore_ascii_case("imagenet") => WeightSource::Imagenet {
                bundle: imagenet_bundle,
            },
            Some(path) => WeightSource::File(PathBuf::from(path)),
        }
    }

    /// Label stored in the model metadata
    pub fn label(&self) -> String {
        match self {
            WeightSource::Random => "random".to_string(),
            WeightSource::Imagenet { .. } => "imagenet".to_string(),
            WeightSource::File(path) => path.display().to_string(),
        }
    }
}

impl FreezePolicy {
    /// `FREEZE_ALL` wins; otherwise `FREEZE_TILL` keeps that many trailing layers trainable
    pub fn from_params(params: &Params) -> Self {
        if params.freeze_all {
            return FreezePolicy::All;
        }
        match params.freeze_till {
            Some(n) if n > 0 => FreezePolicy::KeepLast(n),
            _ => FreezePolicy::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareBaseModelConfig {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub image_size: ImageSize,
    pub learning_rate: f64,
    pub include_top: bool,
    pub weights: WeightSource,
    pub classes: usize,
    pub freeze: FreezePolicy,
    /// Narrower backbone blocks; `None` keeps the VGG16 widths
    pub backbone_channels: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub training_data: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub is_augmentation: bool,
    pub image_size: ImageSize,
    pub learning_rate: f64,
    pub validation_split: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationConfig {
    pub path_of_model: PathBuf,
    pub training_data: PathBuf,
    pub scores_path: PathBuf,
    pub all_params: Params,
    pub mlflow_uri: Option<String>,
    pub image_size: ImageSize,
    pub batch_size: usize,
    pub evaluation_split: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionConfig {
    pub model_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_source_parsing() {
        let bundle = PathBuf::from("artifacts/weights/vgg16_imagenet.tar.gz");
        assert_eq!(
            WeightSource::from_param(Some("imagenet"), bundle.clone()),
            WeightSource::Imagenet {
                bundle: bundle.clone()
            }
        );
        assert_eq!(WeightSource::from_param(None, bundle.clone()), WeightSource::Random);
        assert_eq!(WeightSource::from_param(Some("None"), bundle.clone()), WeightSource::Random);
        assert_eq!(
            WeightSource::from_param(Some("weights/custom.tar.gz"), bundle),
            WeightSource::File(PathBuf::from("weights/custom.tar.gz"))
        );
    }

    #[test]
    fn test_freeze_policy_from_params() {
        let mut params = Params::default();
        assert_eq!(FreezePolicy::from_params(&params), FreezePolicy::All);

        params.freeze_all = false;
        assert_eq!(FreezePolicy::from_params(&params), FreezePolicy::None);

        params.freeze_till = Some(4);
        assert_eq!(FreezePolicy::from_params(&params), FreezePolicy::KeepLast(4));
    }
}
