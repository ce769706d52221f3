//! Stage drivers.
//!
//! Every stage reads its configuration, checks the files it consumes, runs
//! its component and checks the files it produced. Stages never share
//! in-memory state; the artifact contracts are the only interface.

use anyhow::Context;
use burn::tensor::backend::AutodiffBackend;
use std::fmt;
use std::path::Path;
use tracing::Instrument;

use crate::components::{DataIngestion, Evaluation, PrepareBaseModel, Training, TrainingHistory};
use crate::config::{
    ConfigurationManager, EvaluationConfig, PrepareBaseModelConfig, TrainingConfig,
};
use crate::error::{EvaluationError, ModelError, StageError, TrainingError};
use crate::logging::LoggingConfig;
use crate::ml::{dispatch, BackendTask};
use crate::model::{ArtifactFormat, ArtifactSpec, ModelKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StageName {
    DataIngestion,
    PrepareBaseModel,
    Training,
    Evaluation,
}

impl StageName {
    /// Execution order of a full run
    pub const ALL: [StageName; 4] = [
        StageName::DataIngestion,
        StageName::PrepareBaseModel,
        StageName::Training,
        StageName::Evaluation,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            StageName::DataIngestion => "Data Ingestion Stage",
            StageName::PrepareBaseModel => "Prepare base model",
            StageName::Training => "Training",
            StageName::Evaluation => "Evaluation Stage",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

struct PrepareTask(PrepareBaseModelConfig);

impl BackendTask for PrepareTask {
    type Output = Result<(), ModelError>;

    fn run<B: AutodiffBackend>(self, device: B::Device) -> Self::Output {
        let mut preparer = PrepareBaseModel::<B>::new(self.0, device);
        let base = preparer.get_base_model()?;
        tracing::info!("Base model saved at {}", base.display());
        let updated = preparer.update_base_model()?;
        tracing::info!("Updated base model saved at {}", updated.display());
        Ok(())
    }
}

struct TrainTask(TrainingConfig);

impl BackendTask for TrainTask {
    type Output = Result<TrainingHistory, TrainingError>;

    fn run<B: AutodiffBackend>(self, device: B::Device) -> Self::Output {
        let mut training = Training::<B>::new(self.0, device);
        training.load_base()?;
        training.build_generators()?;
        training.fit()
    }
}

struct EvaluateTask(EvaluationConfig);

impl BackendTask for EvaluateTask {
    type Output = Result<Evaluation, EvaluationError>;

    fn run<B: AutodiffBackend>(self, device: B::Device) -> Self::Output {
        let mut evaluation = Evaluation::new(self.0);
        evaluation.evaluate::<B::InnerBackend>(&device)?;
        Ok(evaluation)
    }
}

/// One stage bound to a loaded configuration
pub struct Stage<'a> {
    name: StageName,
    manager: &'a ConfigurationManager,
}

impl<'a> Stage<'a> {
    pub fn new(name: StageName, manager: &'a ConfigurationManager) -> Self {
        Self { name, manager }
    }

    pub fn name(&self) -> StageName {
        self.name
    }

    /// Files that must exist before the stage starts
    pub fn inputs(&self) -> Vec<ArtifactSpec> {
        let config = self.manager.config();
        match self.name {
            StageName::DataIngestion | StageName::PrepareBaseModel => Vec::new(),
            StageName::Training => vec![
                ArtifactSpec::new(
                    &config.prepare_base_model.updated_base_model_path,
                    ArtifactFormat::ModelBundle(ModelKind::Classifier),
                ),
                ArtifactSpec::new(config.training_data(), ArtifactFormat::ImageFolder),
            ],
            StageName::Evaluation => {
                let evaluation = &config.evaluation;
                vec![
                    ArtifactSpec::new(
                        evaluation
                            .path_of_model
                            .clone()
                            .unwrap_or_else(|| config.training.trained_model_path.clone()),
                        ArtifactFormat::ModelBundle(ModelKind::Classifier),
                    ),
                    ArtifactSpec::new(
                        evaluation
                            .training_data
                            .clone()
                            .unwrap_or_else(|| config.training_data()),
                        ArtifactFormat::ImageFolder,
                    ),
                ]
            }
        }
    }

    /// Files the stage must have produced
    pub fn outputs(&self) -> Vec<ArtifactSpec> {
        let config = self.manager.config();
        match self.name {
            StageName::DataIngestion => vec![
                ArtifactSpec::new(&config.data_ingestion.local_data_file, ArtifactFormat::Archive),
                ArtifactSpec::new(config.training_data(), ArtifactFormat::ImageFolder),
            ],
            StageName::PrepareBaseModel => vec![
                ArtifactSpec::new(
                    &config.prepare_base_model.base_model_path,
                    ArtifactFormat::ModelBundle(ModelKind::Backbone),
                ),
                ArtifactSpec::new(
                    &config.prepare_base_model.updated_base_model_path,
                    ArtifactFormat::ModelBundle(ModelKind::Classifier),
                ),
            ],
            StageName::Training => vec![ArtifactSpec::new(
                &config.training.trained_model_path,
                ArtifactFormat::ModelBundle(ModelKind::Classifier),
            )],
            StageName::Evaluation => vec![ArtifactSpec::new(
                config
                    .evaluation
                    .scores_path
                    .clone()
                    .unwrap_or_else(|| "scores.json".into()),
                ArtifactFormat::ScoresJson,
            )],
        }
    }

    /// Check inputs, run the component, check outputs
    pub async fn run(&self) -> Result<(), StageError> {
        for input in self.inputs() {
            input.check()?;
        }

        match self.name {
            StageName::DataIngestion => {
                let ingestion = DataIngestion::new(self.manager.get_data_ingestion_config()?);
                ingestion.download_file().await?;
                ingestion.extract_zip_file()?;
            }
            StageName::PrepareBaseModel => {
                let config = self.manager.get_prepare_base_model_config()?;
                dispatch(self.manager.device(), PrepareTask(config))?;
            }
            StageName::Training => {
                let config = self.manager.get_training_config()?;
                let history = dispatch(self.manager.device(), TrainTask(config))?;
                if let Some(last) = history.last() {
                    tracing::info!(
                        "Final epoch: loss {:.4}, accuracy {:.4}",
                        last.loss,
                        last.accuracy
                    );
                }
            }
            StageName::Evaluation => {
                let config = self.manager.get_evaluation_config()?;
                let evaluation = dispatch(self.manager.device(), EvaluateTask(config))?;
                evaluation.save_score()?;
                evaluation.log_experiment().await?;
            }
        }

        for output in self.outputs() {
            output.check()?;
        }
        Ok(())
    }
}

/// Run one stage inside its span, framed by the start/completion banners
pub async fn run_stage(name: StageName, manager: &ConfigurationManager) -> Result<(), StageError> {
    let span = tracing::info_span!("stage", name = name.title());
    async {
        tracing::info!(">>>>>> stage {} started <<<<<<", name);
        match Stage::new(name, manager).run().await {
            Ok(()) => {
                tracing::info!(">>>>>> stage {} completed <<<<<<\n\nx==========x", name);
                Ok(())
            }
            Err(err) => {
                tracing::error!("stage {} failed: {}", name, err);
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

/// Run every stage in order, stopping at the first failure
pub async fn run_all(manager: &ConfigurationManager) -> Result<(), StageError> {
    for name in StageName::ALL {
        run_stage(name, manager).await?;
    }
    Ok(())
}

/// Entry point shared by the stage binaries and the CLI.
///
/// Loads `.env`, installs run-scoped logging, reads the configuration and
/// runs `stages` in order. Must run on a single-threaded runtime so the
/// scoped subscriber sees every event.
pub async fn drive(stages: &[StageName], config_path: &Path, params_path: &Path) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let logging = LoggingConfig::default()
        .build()
        .context("failed to set up logging")?;
    let _scope = logging.scoped();

    let result = async {
        let manager = ConfigurationManager::new(config_path, params_path).with_context(|| {
            format!(
                "failed to load {} and {}",
                config_path.display(),
                params_path.display()
            )
        })?;
        for &name in stages {
            run_stage(name, &manager)
                .await
                .with_context(|| format!("stage {name} failed"))?;
        }
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = &result {
        tracing::error!("{:#}", err);
    }
    result
}
