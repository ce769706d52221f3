//! Backbone acquisition and transfer-learning head setup.

use burn::tensor::backend::Backend;
use std::path::{Path, PathBuf};

use crate::config::{PrepareBaseModelConfig, WeightSource};
use crate::error::ModelError;
use crate::ml::{BackboneConfig, ClassifierConfig, CnnClassifier, FreezePolicy, LayerSummary, Vgg16};
use crate::model::{load_backbone, save_module, CompileSettings, ModelMetadata};

pub struct PrepareBaseModel<B: Backend> {
    config: PrepareBaseModelConfig,
    device: B::Device,
    backbone_config: BackboneConfig,
    model: Option<Vgg16<B>>,
}

/// Log the model summary layer by layer
fn log_summary(layers: &[LayerSummary]) {
    for layer in layers {
        tracing::debug!(
            layer = %layer.name,
            params = layer.params,
            trainable = layer.trainable,
            "summary"
        );
    }
    let total: usize = layers.iter().map(|l| l.params).sum();
    let trainable: usize = layers.iter().filter(|l| l.trainable).map(|l| l.params).sum();
    tracing::info!(
        "Model summary: {} layers, total params: {}, trainable params: {}, non-trainable params: {}",
        layers.len(),
        total,
        trainable,
        total - trainable
    );
}

impl<B: Backend> PrepareBaseModel<B> {
    pub fn new(config: PrepareBaseModelConfig, device: B::Device) -> Self {
        let mut backbone_config = BackboneConfig::vgg16(config.image_size, config.include_top);
        if let Some(channels) = &config.backbone_channels {
            backbone_config.channels = channels.clone();
        }
        Self {
            config,
            device,
            backbone_config,
            model: None,
        }
    }

    pub fn backbone_config(&self) -> &BackboneConfig {
        &self.backbone_config
    }

    /// Load a backbone bundle and check it fits the configured architecture.
    ///
    /// Without the top the convolution weights do not depend on the input
    /// size, so only the channel layout and the top flag must match.
    fn load_weights(&self, path: &Path) -> Result<Vgg16<B>, ModelError> {
        let (metadata, model) = load_backbone::<B>(path, &self.device)?;
        let stored = &metadata.backbone;
        let expected = &self.backbone_config;

        let mismatch = |reason: String| ModelError::ArchitectureMismatch {
            path: path.to_path_buf(),
            reason,
        };
        if stored.channels != expected.channels || stored.depths != expected.depths {
            return Err(mismatch(format!(
                "blocks {:?}x{:?} instead of {:?}x{:?}",
                stored.channels, stored.depths, expected.channels, expected.depths
            )));
        }
        if stored.include_top != expected.include_top {
            return Err(mismatch(format!("include_top is {}", stored.include_top)));
        }
        if expected.include_top
            && (stored.image_height, stored.image_width)
                != (expected.image_height, expected.image_width)
        {
            return Err(mismatch(format!(
                "the top was built for {}x{} inputs",
                stored.image_height, stored.image_width
            )));
        }
        Ok(model)
    }

    /// Instantiate the backbone from the configured weight source and save it
    pub fn get_base_model(&mut self) -> Result<PathBuf, ModelError> {
        let model = match &self.config.weights {
            WeightSource::Random => self.backbone_config.init::<B>(&self.device)?,
            WeightSource::Imagenet { bundle } if bundle.exists() => {
                tracing::info!("Loading ImageNet weights from {}", bundle.display());
                self.load_weights(bundle)?
            }
            WeightSource::Imagenet { bundle } => {
                tracing::warn!(
                    "ImageNet weight bundle {} not found, initialising the backbone randomly",
                    bundle.display()
                );
                self.backbone_config.init::<B>(&self.device)?
            }
            WeightSource::File(path) => {
                tracing::info!("Loading backbone weights from {}", path.display());
                self.load_weights(path)?
            }
        };

        let metadata = ModelMetadata::backbone(self.backbone_config.clone(), self.config.weights.label());
        let path = save_module(&self.config.base_model_path, &metadata, model.clone())?;
        self.model = Some(model);
        Ok(path)
    }

    /// Freeze the backbone, attach the dense head and record the compile settings.
    pub fn prepare_full_model(
        backbone: Vgg16<B>,
        backbone_config: &BackboneConfig,
        classes: usize,
        freeze: FreezePolicy,
        learning_rate: f64,
        device: &B::Device,
    ) -> Result<(CnnClassifier<B>, ClassifierConfig, usize), ModelError> {
        let frozen = freeze.frozen_layers(backbone_config.num_layers())?;
        let config = ClassifierConfig::new(backbone_config.clone(), classes);
        let model = CnnClassifier::from_backbone(backbone, &config, device).freeze_backbone(frozen);

        tracing::info!(
            "Classifier head: {} features -> {} classes, {} frozen backbone layers, SGD lr={}",
            backbone_config.feature_dim(),
            classes,
            frozen,
            learning_rate
        );
        log_summary(&config.layer_summary(frozen));

        Ok((model, config, frozen))
    }

    /// Build the classifier on the prepared backbone and save it
    pub fn update_base_model(&mut self) -> Result<PathBuf, ModelError> {
        let backbone = match self.model.take() {
            Some(model) => model,
            None => load_backbone::<B>(&self.config.base_model_path, &self.device)?.1,
        };

        let (model, config, frozen) = Self::prepare_full_model(
            backbone,
            &self.backbone_config,
            self.config.classes,
            self.config.freeze,
            self.config.learning_rate,
            &self.device,
        )?;

        let metadata = ModelMetadata::classifier(
            &config,
            frozen,
            CompileSettings::sgd(self.config.learning_rate),
            self.config.weights.label(),
        );
        save_module(&self.config.updated_base_model_path, &metadata, model)
    }
}
