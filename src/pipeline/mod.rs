pub mod prediction;
pub mod stages;

pub use prediction::{Diagnosis, ImageClassifier, LoadClassifier, PredictionPipeline};
pub use stages::{drive, run_all, run_stage, Stage, StageName};
