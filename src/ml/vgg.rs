//! VGG16 backbone and the transfer-learning classifier built on top of it.
//!
//! The backbone mirrors the Keras layer sequence without the input layer:
//! five blocks of 3x3 convolutions (same padding) each closed by a 2x2 max
//! pooling, optionally followed by the three dense "top" layers.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::config::ImageSize;
use crate::error::ModelError;

/// Output channels of the five VGG16 blocks
pub const VGG16_CHANNELS: [usize; 5] = [64, 128, 256, 512, 512];

/// Convolutions per VGG16 block
pub const VGG16_DEPTHS: [usize; 5] = [2, 2, 3, 3, 3];

/// Backbone configuration
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Output channels per block
    pub channels: Vec<usize>,
    /// Number of convolutions per block
    pub depths: Vec<usize>,
    /// Input height (pixels)
    pub image_height: usize,
    /// Input width (pixels)
    pub image_width: usize,
    /// Attach the fully connected ImageNet top (fc1, fc2, predictions)
    #[config(default = false)]
    pub include_top: bool,
    /// Units of the two hidden top layers
    #[config(default = 4096)]
    pub top_units: usize,
    /// Output classes of the top's prediction layer
    #[config(default = 1000)]
    pub top_classes: usize,
}

/// One row of the model summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub name: String,
    pub params: usize,
    pub trainable: bool,
}

impl BackboneConfig {
    /// Standard VGG16 for the given input size
    pub fn vgg16(image_size: ImageSize, include_top: bool) -> Self {
        Self::new(
            VGG16_CHANNELS.to_vec(),
            VGG16_DEPTHS.to_vec(),
            image_size.height,
            image_size.width,
        )
        .with_include_top(include_top)
    }

    /// Spatial size after the final pooling stage
    pub fn output_size(&self) -> (usize, usize) {
        let stages = self.channels.len() as u32;
        (
            self.image_height >> stages,
            self.image_width >> stages,
        )
    }

    /// Flattened feature dimension seen by the classification head
    pub fn feature_dim(&self) -> usize {
        if self.include_top {
            return self.top_classes;
        }
        let (height, width) = self.output_size();
        self.channels.last().copied().unwrap_or(0) * height * width
    }

    /// Number of entries in the backbone layer sequence
    /// (convolutions + poolings + top layers)
    pub fn num_layers(&self) -> usize {
        let convs: usize = self.depths.iter().sum();
        let pools = self.channels.len();
        let top = if self.include_top { 3 } else { 0 };
        convs + pools + top
    }

    /// Layer names, parameter counts and trainable flags for `frozen` leading layers
    pub fn layer_summary(&self, frozen: usize) -> Vec<LayerSummary> {
        let mut layers = Vec::with_capacity(self.num_layers());
        let mut in_channels = 3;

        for (block, (&channels, &depth)) in self.channels.iter().zip(&self.depths).enumerate() {
            for conv in 0..depth {
                layers.push((
                    format!("block{}_conv{}", block + 1, conv + 1),
                    3 * 3 * in_channels * channels + channels,
                ));
                in_channels = channels;
            }
            layers.push((format!("block{}_pool", block + 1), 0));
        }

        if self.include_top {
            let (height, width) = self.output_size();
            let flat = in_channels * height * width;
            layers.push(("fc1".to_string(), flat * self.top_units + self.top_units));
            layers.push((
                "fc2".to_string(),
                self.top_units * self.top_units + self.top_units,
            ));
            layers.push((
                "predictions".to_string(),
                self.top_units * self.top_classes + self.top_classes,
            ));
        }

        layers
            .into_iter()
            .enumerate()
            .map(|(index, (name, params))| LayerSummary {
                name,
                params,
                trainable: index >= frozen,
            })
            .collect()
    }

    /// Initialize the backbone with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Vgg16<B>, ModelError> {
        let (height, width) = self.output_size();
        if height == 0 || width == 0 {
            return Err(ModelError::InputTooSmall {
                height: self.image_height,
                width: self.image_width,
            });
        }

        let mut in_channels = 3;
        let mut blocks = Vec::with_capacity(self.channels.len());
        for (&channels, &depth) in self.channels.iter().zip(&self.depths) {
            let mut convs = Vec::with_capacity(depth);
            for _ in 0..depth {
                convs.push(
                    Conv2dConfig::new([in_channels, channels], [3, 3])
                        .with_padding(PaddingConfig2d::Same)
                        .init(device),
                );
                in_channels = channels;
            }
            blocks.push(VggBlock {
                convs,
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                activation: Relu::new(),
            });
        }

        let top = self.include_top.then(|| {
            let flat = in_channels * height * width;
            VggTop {
                fc1: LinearConfig::new(flat, self.top_units).init(device),
                fc2: LinearConfig::new(self.top_units, self.top_units).init(device),
                predictions: LinearConfig::new(self.top_units, self.top_classes).init(device),
                activation: Relu::new(),
            }
        });

        Ok(Vgg16 { blocks, top })
    }
}

/// Convolution block: {Conv 3x3 + ReLU} x depth, then 2x2 max pooling
#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    activation: Relu,
}

/// ImageNet classification top
#[derive(Module, Debug)]
pub struct VggTop<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    predictions: Linear<B>,
    activation: Relu,
}

/// VGG16 feature extractor
#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    blocks: Vec<VggBlock<B>>,
    top: Option<VggTop<B>>,
}

impl<B: Backend> Vgg16<B> {
    /// Forward pass, flattened to `[batch_size, feature_dim]`.
    ///
    /// With the top attached the output is the softmax over the top classes.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for block in &self.blocks {
            for conv in &block.convs {
                x = block.activation.forward(conv.forward(x));
            }
            x = block.pool.forward(x);
        }

        let [batch_size, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        match &self.top {
            Some(top) => {
                let x = top.activation.forward(top.fc1.forward(x));
                let x = top.activation.forward(top.fc2.forward(x));
                softmax(top.predictions.forward(x), 1)
            }
            None => x,
        }
    }

    /// Mark the first `count` layers of the sequence as non-trainable.
    ///
    /// Pooling layers count as layers but carry no parameters.
    pub fn freeze_first(self, count: usize) -> Self {
        let mut layer = 0;
        let mut blocks = Vec::with_capacity(self.blocks.len());

        for block in self.blocks {
            let mut convs = Vec::with_capacity(block.convs.len());
            for conv in block.convs {
                convs.push(if layer < count { conv.no_grad() } else { conv });
                layer += 1;
            }
            layer += 1;
            blocks.push(VggBlock {
                convs,
                pool: block.pool,
                activation: block.activation,
            });
        }

        let top = self.top.map(|top| {
            let fc1 = if layer < count { top.fc1.no_grad() } else { top.fc1 };
            let fc2 = if layer + 1 < count { top.fc2.no_grad() } else { top.fc2 };
            let predictions = if layer + 2 < count {
                top.predictions.no_grad()
            } else {
                top.predictions
            };
            VggTop {
                fc1,
                fc2,
                predictions,
                activation: top.activation,
            }
        });

        Self { blocks, top }
    }
}

/// Which backbone layers stay trainable during fine-tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezePolicy {
    /// Freeze the whole backbone; only the new head trains
    All,
    /// Keep the last N backbone layers trainable
    KeepLast(usize),
    /// Fine-tune everything
    None,
}

impl FreezePolicy {
    /// Number of leading layers to freeze for a backbone of `layers` layers.
    ///
    /// A `KeepLast` count larger than the layer sequence is rejected.
    pub fn frozen_layers(&self, layers: usize) -> Result<usize, ModelError> {
        match *self {
            FreezePolicy::All => Ok(layers),
            FreezePolicy::None => Ok(0),
            FreezePolicy::KeepLast(keep) if keep > layers => Err(ModelError::FreezeOutOfRange {
                freeze_till: keep,
                layers,
            }),
            FreezePolicy::KeepLast(keep) => Ok(layers - keep),
        }
    }
}

/// Classifier configuration: backbone + flatten + dense softmax head
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub backbone: BackboneConfig,
    /// Number of output classes
    pub num_classes: usize,
}

impl ClassifierConfig {
    /// Initialize with a random backbone
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CnnClassifier<B>, ModelError> {
        let backbone = self.backbone.init(device)?;
        Ok(CnnClassifier::from_backbone(backbone, self, device))
    }

    /// Backbone summary followed by the flatten and dense head rows
    pub fn layer_summary(&self, frozen: usize) -> Vec<LayerSummary> {
        let features = self.backbone.feature_dim();
        let mut layers = self.backbone.layer_summary(frozen);
        layers.push(LayerSummary {
            name: "flatten".to_string(),
            params: 0,
            trainable: true,
        });
        layers.push(LayerSummary {
            name: "dense".to_string(),
            params: features * self.num_classes + self.num_classes,
            trainable: true,
        });
        layers
    }
}

/// Transfer-learning classifier
///
/// # Architecture
/// - VGG16 backbone (optionally with its ImageNet top)
/// - Flatten
/// - Dense: feature_dim -> num_classes
/// - Softmax (at prediction time; training uses the logits)
#[derive(Module, Debug)]
pub struct CnnClassifier<B: Backend> {
    backbone: Vgg16<B>,
    head: Linear<B>,
}

impl<B: Backend> CnnClassifier<B> {
    /// Attach a fresh classification head to an existing backbone
    pub fn from_backbone(backbone: Vgg16<B>, config: &ClassifierConfig, device: &B::Device) -> Self {
        Self {
            backbone,
            head: LinearConfig::new(config.backbone.feature_dim(), config.num_classes).init(device),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// - `images`: batch `[batch_size, 3, height, width]`, values in [0, 1]
    ///
    /// # Returns
    /// - class logits `[batch_size, num_classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(features)
    }

    /// Normalized class probabilities
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// Forward pass plus categorical cross-entropy loss
    ///
    /// # Returns
    /// - (mean loss, logits)
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets);
        (loss, output)
    }

    /// Freeze the first `count` backbone layers
    pub fn freeze_backbone(self, count: usize) -> Self {
        Self {
            backbone: self.backbone.freeze_first(count),
            head: self.head,
        }
    }
}
