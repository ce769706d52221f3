//! Model bundle metadata.
//!
//! Every persisted model is a tar.gz bundle holding `metadata.json` (this
//! struct) and `model.bin` (the weights). The metadata carries enough to
//! rebuild the module before its record is loaded.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ModelError;
use crate::ml::{BackboneConfig, ClassifierConfig};

/// What a bundle contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Bare VGG16 feature extractor
    Backbone,
    /// Backbone plus the dense classification head
    Classifier,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Backbone => write!(f, "backbone"),
            ModelKind::Classifier => write!(f, "classifier"),
        }
    }
}

/// Training setup recorded with a compiled classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileSettings {
    pub optimizer: String,
    pub loss: String,
    pub metrics: Vec<String>,
    pub learning_rate: f64,
}

impl CompileSettings {
    /// SGD + categorical cross-entropy, tracking accuracy
    pub fn sgd(learning_rate: f64) -> Self {
        Self {
            optimizer: "sgd".to_string(),
            loss: "categorical_crossentropy".to_string(),
            metrics: vec!["accuracy".to_string()],
            learning_rate,
        }
    }
}

/// Model metadata
///
/// Stored in the bundle as:
/// - metadata.json: this struct (JSON)
/// - model.bin: module record (binary)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub kind: ModelKind,

    /// Backbone architecture (input size, blocks, top)
    pub backbone: BackboneConfig,

    /// Classification head width; `None` for a bare backbone
    #[serde(default)]
    pub num_classes: Option<usize>,

    /// Class names in label order, e.g. ["Normal", "Tumor"]; empty until trained
    #[serde(default)]
    pub class_labels: Vec<String>,

    /// Leading backbone layers excluded from training
    #[serde(default)]
    pub frozen_layers: usize,

    #[serde(default)]
    pub compile: Option<CompileSettings>,

    /// Epochs trained so far
    #[serde(default)]
    pub num_epochs: usize,

    /// Origin of the backbone weights ("random", "imagenet", a path)
    pub weights: String,

    /// Creation time (RFC 3339)
    pub created_at: String,
}

impl ModelMetadata {
    /// Metadata for a bare backbone bundle
    pub fn backbone(backbone: BackboneConfig, weights: impl Into<String>) -> Self {
        Self {
            kind: ModelKind::Backbone,
            backbone,
            num_classes: None,
            class_labels: Vec::new(),
            frozen_layers: 0,
            compile: None,
            num_epochs: 0,
            weights: weights.into(),
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// Metadata for a classifier bundle
    pub fn classifier(
        config: &ClassifierConfig,
        frozen_layers: usize,
        compile: CompileSettings,
        weights: impl Into<String>,
    ) -> Self {
        Self {
            kind: ModelKind::Classifier,
            backbone: config.backbone.clone(),
            num_classes: Some(config.num_classes),
            class_labels: Vec::new(),
            frozen_layers,
            compile: Some(compile),
            num_epochs: 0,
            weights: weights.into(),
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// Rebuild the classifier configuration; `None` for backbone bundles
    pub fn classifier_config(&self) -> Option<ClassifierConfig> {
        match (self.kind, self.num_classes) {
            (ModelKind::Classifier, Some(num_classes)) => {
                Some(ClassifierConfig::new(self.backbone.clone(), num_classes))
            }
            _ => None,
        }
    }

    /// Record a finished training run
    pub fn trained(mut self, epochs: usize, class_labels: Vec<String>) -> Self {
        self.num_epochs += epochs;
        self.class_labels = class_labels;
        self.created_at = chrono::Local::now().to_rfc3339();
        self
    }

    /// Serialize metadata to a JSON string
    pub fn to_json_string(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse metadata from a JSON string
    pub fn from_json_string(json: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(json)?)
    }
}
