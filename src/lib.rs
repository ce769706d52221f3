//! Kidney CT scan tumor/normal classification.
//!
//! A four-stage training pipeline (data ingestion, base-model preparation,
//! training, evaluation) built on a VGG16 transfer-learning model, plus a
//! prediction pipeline and an HTTP upload-and-predict service.

#![recursion_limit = "256"]

pub mod components;
pub mod config;
pub mod error;
pub mod logging;
pub mod ml;
pub mod model;
pub mod pipeline;
pub mod server;

pub use error::{
    ConfigError, EvaluationError, ImageLoadError, IngestionError, ModelError, PredictionError,
    StageError, TrackingError, TrainingError,
};
