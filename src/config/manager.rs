//! Loads both YAML documents and hands out per-stage configuration.

use std::path::{Path, PathBuf};

use crate::config::entity::{
    DataIngestionConfig, EvaluationConfig, PredictionConfig, PrepareBaseModelConfig,
    TrainingConfig, WeightSource,
};
use crate::config::settings::{read_yaml, DeviceType, Params, StructuralConfig};
use crate::error::ConfigError;
use crate::ml::FreezePolicy;

pub const CONFIG_FILE_PATH: &str = "config/config.yaml";
pub const PARAMS_FILE_PATH: &str = "params.yaml";

/// Create each directory (and its parents) if missing
pub fn create_directories<P: AsRef<Path>>(paths: &[P]) -> Result<(), ConfigError> {
    for path in paths {
        std::fs::create_dir_all(path)?;
        tracing::info!("Directory created at: {}", path.as_ref().display());
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    config: StructuralConfig,
    params: Params,
}

impl ConfigurationManager {
    /// Load and validate both documents, then create the artifacts root
    pub fn new(config_path: &Path, params_path: &Path) -> Result<Self, ConfigError> {
        let config: StructuralConfig = read_yaml(config_path)?;
        let params: Params = read_yaml(params_path)?;
        Self::from_parts(config, params)
    }

    pub fn from_default_paths() -> Result<Self, ConfigError> {
        Self::new(Path::new(CONFIG_FILE_PATH), Path::new(PARAMS_FILE_PATH))
    }

    pub fn from_parts(config: StructuralConfig, params: Params) -> Result<Self, ConfigError> {
        config.validate()?;
        params.validate()?;
        create_directories(&[&config.artifacts_root])?;
        Ok(Self { config, params })
    }

    pub fn config(&self) -> &StructuralConfig {
        &self.config
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn device(&self) -> DeviceType {
        self.config.device
    }

    fn imagenet_bundle(&self) -> PathBuf {
        self.config
            .artifacts_root
            .join("weights")
            .join("vgg16_imagenet.tar.gz")
    }

    pub fn get_data_ingestion_config(&self) -> Result<DataIngestionConfig, ConfigError> {
        let section = &self.config.data_ingestion;
        create_directories(&[&section.root_dir])?;

        Ok(DataIngestionConfig {
            root_dir: section.root_dir.clone(),
            source_url: section.source_url.clone(),
            local_data_file: section.local_data_file.clone(),
            unzip_dir: section.unzip_dir.clone(),
        })
    }

    pub fn get_prepare_base_model_config(&self) -> Result<PrepareBaseModelConfig, ConfigError> {
        let section = &self.config.prepare_base_model;
        create_directories(&[&section.root_dir])?;

        Ok(PrepareBaseModelConfig {
            root_dir: section.root_dir.clone(),
            base_model_path: section.base_model_path.clone(),
            updated_base_model_path: section.updated_base_model_path.clone(),
            image_size: self.params.image_size()?,
            learning_rate: self.params.learning_rate,
            include_top: self.params.include_top,
            weights: WeightSource::from_param(self.params.weights.as_deref(), self.imagenet_bundle()),
            classes: self.params.classes,
            freeze: FreezePolicy::from_params(&self.params),
            backbone_channels: self.params.backbone_channels.clone(),
        })
    }

    pub fn get_training_config(&self) -> Result<TrainingConfig, ConfigError> {
        let section = &self.config.training;
        create_directories(&[&section.root_dir])?;

        Ok(TrainingConfig {
            root_dir: section.root_dir.clone(),
            trained_model_path: section.trained_model_path.clone(),
            updated_base_model_path: self.config.prepare_base_model.updated_base_model_path.clone(),
            training_data: self.config.training_data(),
            epochs: self.params.epochs,
            batch_size: self.params.batch_size,
            is_augmentation: self.params.augmentation,
            image_size: self.params.image_size()?,
            learning_rate: self.params.learning_rate,
            validation_split: self.params.validation_split,
            seed: self.params.seed,
        })
    }

    pub fn get_evaluation_config(&self) -> Result<EvaluationConfig, ConfigError> {
        let section = &self.config.evaluation;
        let scores_path = section
            .scores_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("scores.json"));
        if let Some(parent) = scores_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_directories(&[parent])?;
        }

        Ok(EvaluationConfig {
            path_of_model: section
                .path_of_model
                .clone()
                .unwrap_or_else(|| self.config.training.trained_model_path.clone()),
            training_data: section
                .training_data
                .clone()
                .unwrap_or_else(|| self.config.training_data()),
            scores_path,
            all_params: self.params.clone(),
            mlflow_uri: section.mlflow_uri.clone(),
            image_size: self.params.image_size()?,
            batch_size: self.params.batch_size,
            evaluation_split: self.params.evaluation_split,
        })
    }

    pub fn get_prediction_config(&self) -> PredictionConfig {
        PredictionConfig {
            model_path: self.config.prediction.model_path.clone(),
        }
    }
}
