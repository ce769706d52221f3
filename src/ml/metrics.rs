//! Loss and accuracy bookkeeping.

use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};

use crate::error::ImageLoadError;
use crate::ml::generator::DirectoryGenerator;
use crate::ml::vgg::CnnClassifier;

/// Number of rows whose argmax matches the target class
pub fn correct_predictions<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// Sample-weighted running loss and accuracy
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningScore {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl RunningScore {
    /// Add one batch given its mean loss
    pub fn update(&mut self, mean_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += mean_loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn loss(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.loss_sum / self.samples as f64
    }

    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.correct as f64 / self.samples as f64
    }
}

/// Run `steps` batches of `generator` through `model` without gradients
pub fn evaluate_generator<B: Backend>(
    model: &CnnClassifier<B>,
    generator: &DirectoryGenerator<B>,
    steps: usize,
) -> Result<RunningScore, ImageLoadError> {
    let mut score = RunningScore::default();

    for batch in generator.batches().take(steps) {
        let batch = batch?;
        let batch_size = batch.targets.dims()[0];
        let (loss, output) = model.forward_loss(batch.images, batch.targets.clone());
        let loss = loss.into_scalar().elem::<f64>();
        score.update(loss, correct_predictions(output, batch.targets), batch_size);
    }

    Ok(score)
}
