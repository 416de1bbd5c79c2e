//! Training module for semi-supervised video classification
//!
//! This module provides:
//! - The epoch policy combining labeled and unlabeled batches into one loss
//! - Supervised criteria, distillation-style terms and batch mixing
//! - Unlabeled terms: contrastive, branch divergence and pseudo-labels
//! - Loss scaling, gradient clipping and EMA weights
//! - Learning rate scheduling, evaluation and checkpoint/resume
//!
//! ## Step order
//!
//! 1. Mix the labeled batch (when mixing is active)
//! 2. Supervised loss plus the distillation-style term
//! 3. From `sup_thresh` on: one forward over both unlabeled views and the unlabeled terms
//! 4. Scale, backpropagate, unscale; skip on overflow
//! 5. Clip, optimizer step, EMA update

pub mod checkpoint;
pub mod composition;
pub mod contrastive;
pub mod criterion;
pub mod driver;
pub mod ema;
pub mod evaluator;
pub mod mixup;
pub mod pseudo_label;
pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{BestTracker, CheckpointFile};
pub use composition::{LossComposition, LossPlan};
pub use driver::{run, RunSummary};
pub use ema::ShadowModel;
pub use evaluator::{evaluate, TestStats};
pub use scaler::LossScaler;
pub use scheduler::{EpochScheduler, LRScheduler};
pub use trainer::{DivergenceGuard, EpochPolicy, EpochStats, Learner};

use burn::tensor::{backend::Backend, Tensor};

use crate::utils::error::{Result, ResultExt};

/// Copy a tensor to the host as row-major `f32`
pub(crate) fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>, what: &str) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .model_context(|| format!("reading {}", what))
}
