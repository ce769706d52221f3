//! Fine-tuning the prepared classifier on the labeled image directory.

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer, SgdConfig},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::TrainingConfig;
use crate::error::TrainingError;
use crate::ml::{
    correct_predictions, evaluate_generator, AugmentationConfig, CnnClassifier, DirectoryGenerator,
    GeneratorConfig, ImageAugmenter, RunningScore, Subset,
};
use crate::model::{load_classifier, save_module, ModelMetadata};

/// Metrics of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    /// `None` when the validation subset is smaller than one batch
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

/// Shuffled, augmented training batches and plain validation batches
type Generators<B> = (
    DirectoryGenerator<B>,
    DirectoryGenerator<<B as AutodiffBackend>::InnerBackend>,
);

pub struct Training<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    model: Option<(ModelMetadata, CnnClassifier<B>)>,
    generators: Option<Generators<B>>,
}

impl<B: AutodiffBackend> Training<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            model: None,
            generators: None,
        }
    }

    fn read_base(&self) -> Result<(ModelMetadata, CnnClassifier<B>), TrainingError> {
        let loaded = load_classifier::<B>(&self.config.updated_base_model_path, &self.device)?;
        tracing::info!(
            "Loaded base model from {} ({} frozen layers)",
            self.config.updated_base_model_path.display(),
            loaded.0.frozen_layers
        );
        Ok(loaded)
    }

    /// Load the compiled classifier produced by the base-model stage
    pub fn load_base(&mut self) -> Result<(), TrainingError> {
        self.model = Some(self.read_base()?);
        Ok(())
    }

    /// Build the training and validation generators.
    ///
    /// Both rescale to [0, 1]; only the training generator augments and shuffles.
    pub fn build_generators(&mut self) -> Result<(), TrainingError> {
        self.generators = Some(self.make_generators()?);
        Ok(())
    }

    fn make_generators(&self) -> Result<Generators<B>, TrainingError> {
        let base = GeneratorConfig {
            image_size: self.config.image_size,
            batch_size: self.config.batch_size,
            shuffle: false,
            seed: self.config.seed,
        };
        let split = Some(self.config.validation_split);

        let valid = DirectoryGenerator::<B::InnerBackend>::flow_from_directory(
            &self.config.training_data,
            split,
            Subset::Validation,
            base,
            None,
            &self.device,
        )?;

        let augmenter = self
            .config
            .is_augmentation
            .then(|| ImageAugmenter::new(AugmentationConfig::default()));
        let train = DirectoryGenerator::<B>::flow_from_directory(
            &self.config.training_data,
            split,
            Subset::Training,
            GeneratorConfig {
                shuffle: true,
                ..base
            },
            augmenter,
            &self.device,
        )?;

        Ok((train, valid))
    }

    pub fn generators(&self) -> Option<(&DirectoryGenerator<B>, &DirectoryGenerator<B::InnerBackend>)> {
        self.generators.as_ref().map(|(train, valid)| (train, valid))
    }

    /// Train for the configured number of epochs and save the result
    pub fn fit(&mut self) -> Result<TrainingHistory, TrainingError> {
        let (metadata, mut model) = match self.model.take() {
            Some(loaded) => loaded,
            None => self.read_base()?,
        };
        let (train, valid) = match self.generators.take() {
            Some(generators) => generators,
            None => self.make_generators()?,
        };

        let model_classes = metadata.num_classes.unwrap_or_default();
        if model_classes != train.num_classes() {
            return Err(TrainingError::ClassMismatch {
                model: model_classes,
                data: train.num_classes(),
            });
        }

        let steps_per_epoch = train.steps_per_epoch();
        if steps_per_epoch == 0 {
            return Err(TrainingError::NotEnoughSamples {
                samples: train.samples(),
                batch_size: train.batch_size(),
            });
        }
        let validation_steps = valid.steps_per_epoch();
        if validation_steps == 0 {
            tracing::warn!(
                "{} validation samples are fewer than one batch of {}, skipping validation",
                valid.samples(),
                valid.batch_size()
            );
        }

        let learning_rate = metadata
            .compile
            .as_ref()
            .map_or(self.config.learning_rate, |c| c.learning_rate);
        let mut optim = SgdConfig::new().init::<B, CnnClassifier<B>>();
        let mut history = TrainingHistory::default();

        tracing::info!(
            "Training for {} epochs: {} steps per epoch, {} validation steps",
            self.config.epochs,
            steps_per_epoch,
            validation_steps
        );

        for epoch in 0..self.config.epochs {
            let mut score = RunningScore::default();

            for batch in train.batches().take(steps_per_epoch) {
                let batch = batch?;
                let batch_size = batch.targets.dims()[0];

                let (loss, output) = model.forward_loss(batch.images, batch.targets.clone());
                let loss_value = loss.clone().into_scalar().elem::<f64>();
                let correct = correct_predictions(output, batch.targets);

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(learning_rate, model, grads);

                score.update(loss_value, correct, batch_size);
            }

            let (val_loss, val_accuracy) = if validation_steps > 0 {
                let valid_model = model.valid();
                let val = evaluate_generator(&valid_model, &valid, validation_steps)?;
                (Some(val.loss()), Some(val.accuracy()))
            } else {
                (None, None)
            };

            let metrics = EpochMetrics {
                epoch: epoch + 1,
                loss: score.loss(),
                accuracy: score.accuracy(),
                val_loss,
                val_accuracy,
            };
            tracing::info!(
                "Epoch {}/{}: loss {:.4}, accuracy {:.4}, val_loss {}, val_accuracy {}",
                metrics.epoch,
                self.config.epochs,
                metrics.loss,
                metrics.accuracy,
                val_loss.map_or("-".to_string(), |v| format!("{v:.4}")),
                val_accuracy.map_or("-".to_string(), |v| format!("{v:.4}")),
            );
            history.epochs.push(metrics);
        }

        let metadata = metadata.trained(self.config.epochs, train.class_names().to_vec());
        self.save_model(&metadata, model)?;
        Ok(history)
    }

    fn save_model(&self, metadata: &ModelMetadata, model: CnnClassifier<B>) -> Result<PathBuf, TrainingError> {
        Ok(save_module(&self.config.trained_model_path, metadata, model)?)
    }
}
