//! Error types for the classifier pipeline.
//!
//! Each component owns one error enum; stage drivers collect them into
//! [`StageError`] and binaries wrap everything in `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("YAML file is empty: {0}")]
    EmptyFile(PathBuf),

    #[error("malformed YAML in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Dataset download and extraction errors.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("download of {url} failed: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("download of {url} returned an HTML page instead of the archive (content type {content_type})")]
    HtmlResponse { url: String, content_type: String },

    #[error("corrupt archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("corrupt tar.gz archive {path}: {source}")]
    TarArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Model construction, persistence and bundle errors.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("FREEZE_TILL={freeze_till} exceeds the backbone layer count ({layers})")]
    FreezeOutOfRange { freeze_till: usize, layers: usize },

    #[error("input size {height}x{width} is too small for the backbone (at least 32x32)")]
    InputTooSmall { height: usize, width: usize },

    #[error("weight bundle {path} does not fit the configured backbone: {reason}")]
    ArchitectureMismatch { path: PathBuf, reason: String },

    #[error("expected a {expected} bundle, found {found}: {path}")]
    WrongKind {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("{entry} not found in bundle {path}")]
    MissingEntry { path: PathBuf, entry: &'static str },

    #[error("model record error: {0}")]
    Record(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Image loading and preprocessing errors.
#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no class subdirectories with images found in {0}")]
    EmptyDirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Training stage errors.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("{samples} training samples are fewer than one batch of {batch_size}")]
    NotEnoughSamples { samples: usize, batch_size: usize },

    #[error("model has {model} output classes but the data has {data}")]
    ClassMismatch { model: usize, data: usize },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Images(#[from] ImageLoadError),
}

/// Evaluation stage errors.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluation subset is empty")]
    EmptySubset,

    #[error("model has {model} output classes but the evaluation data has {data}")]
    ClassMismatch { model: usize, data: usize },

    #[error("score is not finite (loss {loss}, accuracy {accuracy})")]
    NonFiniteScore { loss: f64, accuracy: f64 },

    #[error("no score computed yet; call evaluate() first")]
    NotEvaluated,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Images(#[from] ImageLoadError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Experiment tracker errors.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("unsupported tracking URI: {0}")]
    UnsupportedUri(String),

    #[error("tracking server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracking server returned HTTP {status}: {body}")]
    Server { status: u16, body: String },

    #[error("unexpected tracking server response: {0}")]
    Response(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-image prediction errors.
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("prediction needs a two-class classifier, the model has {0} classes")]
    NotBinary(usize),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Image(#[from] ImageLoadError),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Errors surfaced by a stage driver.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage artifact {path} is not a valid {format}: {reason}")]
    Contract {
        path: PathBuf,
        format: String,
        reason: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),
}
