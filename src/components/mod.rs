pub mod data_ingestion;
pub mod model_evaluation;
pub mod model_training;
pub mod prepare_base_model;
pub mod tracking;

pub use data_ingestion::{get_size, resolve_download_url, ArchiveFormat, DataIngestion};
pub use model_evaluation::{Evaluation, Score};
pub use model_training::{EpochMetrics, Training, TrainingHistory};
pub use prepare_base_model::PrepareBaseModel;
pub use tracking::{ExperimentTracker, FileTracker, MlflowTracker, RunRecord, Tracker};
