pub mod entity;
pub mod manager;
pub mod settings;

pub use entity::{
    DataIngestionConfig, EvaluationConfig, PredictionConfig, PrepareBaseModelConfig,
    TrainingConfig, WeightSource,
};
pub use manager::{create_directories, ConfigurationManager, CONFIG_FILE_PATH, PARAMS_FILE_PATH};
pub use settings::{read_yaml, DeviceType, ImageSize, Params, StructuralConfig};
