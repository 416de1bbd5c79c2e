//! Threshold-gated pseudo-labeling
//!
//! Confident predictions on the regular view of an unlabeled clip become
//! hard targets for the fast view of the same clip. A prediction is kept
//! when its top softmax probability is strictly above the threshold. The term
//! is the summed cross-entropy of the kept samples divided by their count,
//! and exactly zero when nothing is kept.

use burn::tensor::{activation, backend::Backend, Tensor, TensorData};

use crate::training::to_host;
use crate::utils::error::Result;
use crate::utils::metrics::argmax;

/// Configuration of the pseudo-label term
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PseudoLabelTerm {
    /// Confidence a prediction must exceed
    pub threshold: f64,
    pub weight: f64,
}

/// Value of the term for one batch
pub struct PseudoLabelLoss<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// Samples above the threshold
    pub count: usize,
    /// `count / batch size`
    pub mask_ratio: f64,
}

/// Pseudo-labels `(sample, class)` of every prediction above `threshold`
pub fn select_confident(probabilities: &[f32], num_classes: usize, threshold: f64) -> Vec<(usize, usize)> {
    probabilities
        .chunks(num_classes)
        .enumerate()
        .filter_map(|(sample, row)| {
            let class = argmax(row);
            (row[class] as f64 > threshold).then_some((sample, class))
        })
        .collect()
}

impl PseudoLabelTerm {
    pub fn forward<B: Backend>(&self, logits_a: Tensor<B, 2>, logits_b: Tensor<B, 2>) -> Result<PseudoLabelLoss<B>> {
        let [m, k] = logits_a.dims();
        let device = logits_b.device();
        let probabilities = to_host(activation::softmax(logits_a.detach(), 1), "pseudo-label confidences")?;

        let confident = select_confident(&probabilities, k, self.threshold);
        let count = confident.len();
        let mask_ratio = if m == 0 { 0.0 } else { count as f64 / m as f64 };

        if count == 0 {
            return Ok(PseudoLabelLoss {
                loss: Tensor::zeros([1], &device),
                count,
                mask_ratio,
            });
        }

        let mut targets = vec![0.0f32; m * k];
        for &(sample, class) in &confident {
            targets[sample * k + class] = 1.0;
        }
        let targets = Tensor::<B, 2>::from_data(TensorData::new(targets, [m, k]), &device);
        let summed = (activation::log_softmax(logits_b, 1) * targets).sum().neg();

        Ok(PseudoLabelLoss {
            loss: summed / count as f64,
            count,
            mask_ratio,
        })
    }
}
