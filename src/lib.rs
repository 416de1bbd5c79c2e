//! # ssl_sifar
//!
//! Semi-supervised video classification with the Burn framework.
//!
//! A small labeled video set and a larger unlabeled one train one classifier.
//! Every step combines a supervised loss on the labeled batch with optional
//! distillation-style terms across classifier branches and, after a warm-up,
//! unlabeled terms (contrastive, branch divergence, pseudo-labels) computed on
//! two temporal views of each unlabeled clip.
//!
//! ## Modules
//!
//! - `config`: the full flag schema of a run
//! - `dataset`: label lists, frame sampling, augmentation, loaders and list splitting
//! - `model`: super-image and temporal-pooling classifiers
//! - `training`: epoch policy, loss terms, scaler, EMA, schedule, evaluation, checkpoints
//! - `utils`: errors, logging, metrics and diagnostics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ssl_sifar::backend::TrainingBackend;
//! use ssl_sifar::config::RunConfig;
//!
//! let config = RunConfig::try_from_args(["ssl_sifar", "--dataset", "synthetic", "--epochs", "2"])?;
//! let summary = ssl_sifar::training::run::<TrainingBackend>(config)?;
//! println!("best top-1: {:.1}%", summary.max_accuracy);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::RunConfig;
pub use dataset::{ClipLoader, DatasetRegistry};
pub use model::{VideoClassifier, VideoClassifierConfig};
pub use training::{run, RunSummary};
pub use utils::error::{Result, SslError};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
