//! Typed views of `config/config.yaml` and `params.yaml`.
//!
//! Both documents are deserialized with `serde_yaml` and validated eagerly,
//! so a missing or nonsensical field fails at load time, not on first use.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Compute device type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// WGPU (GPU) backend
    #[default]
    Wgpu,
    /// NdArray (CPU) backend
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataIngestionSection {
    pub root_dir: PathBuf,
    #[serde(rename = "source_URL")]
    pub source_url: String,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareBaseModelSection {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSection {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    /// Labeled image directory (one subdirectory per class).
    /// Defaults to `<unzip_dir>/kidney-ct-scan-image`.
    #[serde(default)]
    pub training_data: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationSection {
    #[serde(default)]
    pub path_of_model: Option<PathBuf>,
    #[serde(default)]
    pub training_data: Option<PathBuf>,
    #[serde(default)]
    pub scores_path: Option<PathBuf>,
    /// Experiment tracking URI (`file:` path or MLflow server URL)
    #[serde(default)]
    pub mlflow_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSection {
    pub model_path: PathBuf,
}

impl Default for PredictionSection {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model").join("model.tar.gz"),
        }
    }
}

/// Structural configuration (`config/config.yaml`): directories and URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralConfig {
    pub artifacts_root: PathBuf,
    pub data_ingestion: DataIngestionSection,
    pub prepare_base_model: PrepareBaseModelSection,
    pub training: TrainingSection,
    #[serde(default)]
    pub evaluation: EvaluationSection,
    #[serde(default)]
    pub prediction: PredictionSection,
    /// Compute device type
    #[serde(default)]
    pub device: DeviceType,
}

impl StructuralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_ingestion.source_url.trim().is_empty() {
            return Err(ConfigError::invalid(
                "data_ingestion.source_URL",
                "must not be empty",
            ));
        }
        for (field, path) in [
            ("artifacts_root", &self.artifacts_root),
            ("data_ingestion.local_data_file", &self.data_ingestion.local_data_file),
            ("prepare_base_model.base_model_path", &self.prepare_base_model.base_model_path),
            ("training.trained_model_path", &self.training.trained_model_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::invalid(field, "path must not be empty"));
            }
        }
        Ok(())
    }

    /// Directory holding the labeled images used for training and evaluation.
    pub fn training_data(&self) -> PathBuf {
        self.training
            .training_data
            .clone()
            .unwrap_or_else(|| self.data_ingestion.unzip_dir.join("kidney-ct-scan-image"))
    }
}

/// Hyperparameters (`params.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Params {
    pub augmentation: bool,
    /// [height, width, channels]
    pub image_size: Vec<usize>,
    pub batch_size: usize,
    pub include_top: bool,
    pub epochs: usize,
    pub classes: usize,
    /// `imagenet`, `none` or a path to a weight bundle
    #[serde(default)]
    pub weights: Option<String>,
    pub learning_rate: f64,
    #[serde(default = "default_freeze_all")]
    pub freeze_all: bool,
    #[serde(default)]
    pub freeze_till: Option<usize>,
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
    #[serde(default = "default_evaluation_split")]
    pub evaluation_split: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Output channels of the five backbone blocks; VGG16 widths when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backbone_channels: Option<Vec<usize>>,
}

fn default_freeze_all() -> bool {
    true
}

fn default_validation_split() -> f64 {
    0.2
}

fn default_evaluation_split() -> f64 {
    0.3
}

fn default_seed() -> u64 {
    42
}

impl Default for Params {
    fn default() -> Self {
        Self {
            augmentation: true,
            image_size: vec![224, 224, 3],
            batch_size: 16,
            include_top: false,
            epochs: 1,
            classes: 2,
            weights: Some("imagenet".to_string()),
            learning_rate: 0.01,
            freeze_all: default_freeze_all(),
            freeze_till: None,
            validation_split: default_validation_split(),
            evaluation_split: default_evaluation_split(),
            seed: default_seed(),
            backbone_channels: None,
        }
    }
}

/// Validated `IMAGE_SIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageSize {
    /// Smallest side accepted by the five pooling stages of the backbone.
    pub const MIN_SIDE: usize = 32;
}

impl Params {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.image_size()?;
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("BATCH_SIZE", "must be positive"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::invalid("EPOCHS", "must be positive"));
        }
        if self.classes < 2 {
            return Err(ConfigError::invalid("CLASSES", "need at least two classes"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid("LEARNING_RATE", "must be a positive number"));
        }
        for (field, split) in [
            ("VALIDATION_SPLIT", self.validation_split),
            ("EVALUATION_SPLIT", self.evaluation_split),
        ] {
            if !(split > 0.0 && split < 1.0) {
                return Err(ConfigError::invalid(field, format!("{split} is outside (0, 1)")));
            }
        }
        if let Some(channels) = &self.backbone_channels {
            if channels.len() != 5 || channels.contains(&0) {
                return Err(ConfigError::invalid(
                    "BACKBONE_CHANNELS",
                    format!("{channels:?} is not five positive block widths"),
                ));
            }
        }
        Ok(())
    }

    pub fn image_size(&self) -> Result<ImageSize, ConfigError> {
        match self.image_size.as_slice() {
            [height, width, 3] => {
                if *height < ImageSize::MIN_SIDE || *width < ImageSize::MIN_SIDE {
                    return Err(ConfigError::invalid(
                        "IMAGE_SIZE",
                        format!("{height}x{width} is smaller than {0}x{0}", ImageSize::MIN_SIDE),
                    ));
                }
                Ok(ImageSize {
                    height: *height,
                    width: *width,
                    channels: 3,
                })
            }
            other => Err(ConfigError::invalid(
                "IMAGE_SIZE",
                format!("expected [height, width, 3], got {other:?}"),
            )),
        }
    }
}

/// Read a YAML document into `T`.
///
/// An empty (or `null`) document is a [`ConfigError::EmptyFile`], anything that
/// does not parse is [`ConfigError::Malformed`].
pub fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Err(ConfigError::EmptyFile(path.to_path_buf()));
    }
    let value: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    if value.is_null() {
        return Err(ConfigError::EmptyFile(path.to_path_buf()));
    }
    let parsed = serde_yaml::from_value(value).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!("YAML file loaded successfully: {}", path.display());
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG_YAML: &str = r#"
artifacts_root: artifacts
data_ingestion:
  root_dir: artifacts/data_ingestion
  source_URL: https://drive.google.com/file/d/abc123/view?usp=sharing
  local_data_file: artifacts/data_ingestion/data.zip
  unzip_dir: artifacts/data_ingestion
prepare_base_model:
  root_dir: artifacts/prepare_base_model
  base_model_path: artifacts/prepare_base_model/base_model.tar.gz
  updated_base_model_path: artifacts/prepare_base_model/base_model_updated.tar.gz
training:
  root_dir: artifacts/training
  trained_model_path: artifacts/training/model.tar.gz
"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_params() {
        let params = Params::default();
        assert_eq!(params.batch_size, 16);
        assert_eq!(params.classes, 2);
        assert!(params.validate().is_ok());
        assert_eq!(
            params.image_size().unwrap(),
            ImageSize {
                height: 224,
                width: 224,
                channels: 3
            }
        );
    }

    #[test]
    fn test_parse_structural_config() {
        let file = write_temp(CONFIG_YAML);
        let config: StructuralConfig = read_yaml(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.device, DeviceType::Wgpu);
        assert_eq!(
            config.training_data(),
            PathBuf::from("artifacts/data_ingestion/kidney-ct-scan-image")
        );
        assert_eq!(
            config.prediction.model_path,
            PathBuf::from("model").join("model.tar.gz")
        );
        assert!(config.evaluation.mlflow_uri.is_none());
    }

    #[test]
    fn test_parse_params_upper_case_keys() {
        let file = write_temp(
            "AUGMENTATION: True\nIMAGE_SIZE: [224, 224, 3]\nBATCH_SIZE: 16\nINCLUDE_TOP: False\n\
             EPOCHS: 5\nCLASSES: 2\nWEIGHTS: imagenet\nLEARNING_RATE: 0.01\n",
        );
        let params: Params = read_yaml(file.path()).unwrap();
        assert!(params.augmentation);
        assert_eq!(params.epochs, 5);
        assert_eq!(params.weights.as_deref(), Some("imagenet"));
        assert!(params.freeze_all);
        assert_eq!(params.validation_split, 0.2);
        assert_eq!(params.evaluation_split, 0.3);
    }

    #[test]
    fn test_empty_yaml_is_rejected() {
        let file = write_temp("   \n");
        let err = read_yaml::<Params>(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyFile(_)));
    }

    #[test]
    fn test_malformed_yaml_is_rejected() {
        let file = write_temp("EPOCHS: [1, 2\n");
        let err = read_yaml::<Params>(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = read_yaml::<Params>(Path::new("/nonexistent/params.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_invalid_params() {
        let mut params = Params::default();
        params.image_size = vec![224, 224];
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.image_size = vec![16, 16, 3];
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.batch_size = 0;
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.validation_split = 1.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
