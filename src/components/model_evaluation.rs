//! Scoring the trained model on the held-out split.

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::components::tracking::{ExperimentTracker, RunRecord, Tracker};
use crate::config::EvaluationConfig;
use crate::error::EvaluationError;
use crate::ml::{evaluate_generator, DirectoryGenerator, GeneratorConfig, Subset};
use crate::model::load_classifier;

/// Contents of `scores.json`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Score {
    pub loss: f64,
    pub accuracy: f64,
}

pub struct Evaluation {
    config: EvaluationConfig,
    score: Option<Score>,
}

impl Evaluation {
    pub fn new(config: EvaluationConfig) -> Self {
        Self { config, score: None }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Result of the last [`Evaluation::evaluate`] call
    pub fn score(&self) -> Option<Score> {
        self.score
    }

    fn valid_generator<B: Backend>(&self, device: &B::Device) -> Result<DirectoryGenerator<B>, EvaluationError> {
        let generator = DirectoryGenerator::<B>::flow_from_directory(
            &self.config.training_data,
            Some(self.config.evaluation_split),
            Subset::Validation,
            GeneratorConfig {
                image_size: self.config.image_size,
                batch_size: self.config.batch_size,
                shuffle: false,
                seed: self.config.all_params.seed,
            },
            None,
            device,
        )?;
        if generator.is_empty() {
            return Err(EvaluationError::EmptySubset);
        }
        Ok(generator)
    }

    /// Load the trained model and score it on every batch of the evaluation subset
    pub fn evaluate<B: Backend>(&mut self, device: &B::Device) -> Result<Score, EvaluationError> {
        let (metadata, model) = load_classifier::<B>(&self.config.path_of_model, device)?;
        let generator = self.valid_generator::<B>(device)?;

        let model_classes = metadata.num_classes.unwrap_or_default();
        if model_classes != generator.num_classes() {
            return Err(EvaluationError::ClassMismatch {
                model: model_classes,
                data: generator.num_classes(),
            });
        }
        tracing::info!(
            "Evaluating {} on {} images in {} batches",
            self.config.path_of_model.display(),
            generator.samples(),
            generator.len()
        );

        let running = evaluate_generator(&model, &generator, generator.len())?;
        let score = Score {
            loss: running.loss(),
            accuracy: running.accuracy(),
        };
        tracing::info!("Evaluation loss {:.4}, accuracy {:.4}", score.loss, score.accuracy);

        self.score = Some(score);
        Ok(score)
    }

    /// Write the last score to the configured scores file
    pub fn save_score(&self) -> Result<PathBuf, EvaluationError> {
        let score = self.score.ok_or(EvaluationError::NotEvaluated)?;
        if !(score.loss.is_finite() && score.accuracy.is_finite()) {
            return Err(EvaluationError::NonFiniteScore {
                loss: score.loss,
                accuracy: score.accuracy,
            });
        }
        let path = self.config.scores_path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&score)?)?;
        tracing::info!("json file saved at: {}", path.display());
        Ok(path)
    }

    /// Record params, metrics and the model with the configured tracker.
    ///
    /// Returns `Ok(None)` when no tracking URI is configured.
    pub async fn log_experiment(&self) -> Result<Option<String>, EvaluationError> {
        let score = self.score.ok_or(EvaluationError::NotEvaluated)?;
        let Some(uri) = self.config.mlflow_uri.as_deref() else {
            tracing::info!("No tracking URI configured, skipping experiment logging");
            return Ok(None);
        };

        let tracker = Tracker::from_uri(uri)?;
        let run = RunRecord::default()
            .with_params(&self.config.all_params)?
            .with_metric("loss", score.loss)
            .with_metric("accuracy", score.accuracy)
            .with_model(&self.config.path_of_model);

        let run_id = tracker.log_run(&run).await?;
        Ok(Some(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::model_training::tests::fixture;
    use crate::components::model_training::Training;
    use crate::config::Params;
    use crate::ml::generator::tests::write_image_folder;
    use crate::ml::vgg::tests::{TestAutodiffBackend, TestBackend};
    use burn::backend::ndarray::NdArrayDevice;
    use std::path::Path;

    /// Train the tiny classifier for one epoch and point an evaluation at it
    fn trained(root: &Path, per_class: usize) -> EvaluationConfig {
        let mut training = fixture(root, per_class);
        training.epochs = 1;
        training.is_augmentation = false;
        let model = training.trained_model_path.clone();
        let data = training.training_data.clone();
        Training::<TestAutodiffBackend>::new(training, NdArrayDevice::Cpu)
            .fit()
            .unwrap();

        EvaluationConfig {
            path_of_model: model,
            training_data: data,
            scores_path: root.join("scores.json"),
            all_params: Params::default(),
            mlflow_uri: None,
            image_size: crate::config::ImageSize {
                height: 32,
                width: 32,
                channels: 3,
            },
            batch_size: 4,
            evaluation_split: 0.3,
        }
    }

    #[test]
    fn test_evaluate_and_save_score() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluation = Evaluation::new(trained(dir.path(), 10));

        let score = evaluation.evaluate::<TestBackend>(&NdArrayDevice::Cpu).unwrap();
        assert!(score.loss.is_finite());
        assert!((0.0..=1.0).contains(&score.accuracy));

        let path = evaluation.save_score().unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["accuracy", "loss"]);
        assert_eq!(value["loss"], score.loss);
        assert_eq!(value["accuracy"], score.accuracy);
    }

    fn untrained(root: &Path) -> EvaluationConfig {
        EvaluationConfig {
            path_of_model: root.join("model.tar.gz"),
            training_data: root.to_path_buf(),
            scores_path: root.join("scores.json"),
            all_params: Params::default(),
            mlflow_uri: None,
            image_size: crate::config::ImageSize {
                height: 32,
                width: 32,
                channels: 3,
            },
            batch_size: 4,
            evaluation_split: 0.3,
        }
    }

    #[test]
    fn test_save_score_before_evaluate() {
        let dir = tempfile::tempdir().unwrap();
        let evaluation = Evaluation::new(untrained(dir.path()));
        assert!(matches!(evaluation.save_score(), Err(EvaluationError::NotEvaluated)));
    }

    #[test]
    fn test_non_finite_score_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = untrained(dir.path());
        let scores = config.scores_path.clone();
        let mut evaluation = Evaluation::new(config);
        evaluation.score = Some(Score {
            loss: f64::NAN,
            accuracy: 0.5,
        });

        assert!(matches!(
            evaluation.save_score(),
            Err(EvaluationError::NonFiniteScore { accuracy, .. }) if accuracy == 0.5
        ));
        assert!(!scores.exists());
    }

    #[test]
    fn test_class_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = trained(dir.path(), 10);
        write_image_folder(&config.training_data, &[("Cyst", 10)]);

        let mut evaluation = Evaluation::new(config);
        assert!(matches!(
            evaluation.evaluate::<TestBackend>(&NdArrayDevice::Cpu),
            Err(EvaluationError::ClassMismatch { model: 2, data: 3 })
        ));
        assert_eq!(evaluation.score(), None);
    }

    #[test]
    fn test_empty_evaluation_subset() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = trained(dir.path(), 10);
        // floor(10 * 0.05) = 0 images per class
        config.evaluation_split = 0.05;
        let mut evaluation = Evaluation::new(config);
        assert!(matches!(
            evaluation.evaluate::<TestBackend>(&NdArrayDevice::Cpu),
            Err(EvaluationError::EmptySubset)
        ));
    }

    #[tokio::test]
    async fn test_log_experiment_to_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = trained(dir.path(), 10);
        let store = dir.path().join("mlruns");
        config.mlflow_uri = Some(store.to_string_lossy().into_owned());

        let mut evaluation = Evaluation::new(config);
        evaluation.evaluate::<TestBackend>(&NdArrayDevice::Cpu).unwrap();
        let run_id = evaluation.log_experiment().await.unwrap().unwrap();

        let run_dir = store.join("0").join(&run_id);
        assert!(run_dir.join("artifacts/model/model.tar.gz").exists());
        let params = std::fs::read_to_string(run_dir.join("params.json")).unwrap();
        assert!(params.contains("LEARNING_RATE"));
    }

    #[tokio::test]
    async fn test_log_experiment_without_uri() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluation = Evaluation::new(trained(dir.path(), 10));
        evaluation.evaluate::<TestBackend>(&NdArrayDevice::Cpu).unwrap();
        assert_eq!(evaluation.log_experiment().await.unwrap(), None);
    }
}
