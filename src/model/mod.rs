//! Model module for video architectures using the Burn framework
//!
//! ## Model zoo
//!
//! | name          | layout            | base filters |
//! |---------------|-------------------|--------------|
//! | `sifar_tiny`  | super image       | 8            |
//! | `sifar_small` | super image       | 16           |
//! | `tsn_tiny`    | temporal pooling  | 8            |
//! | `tsn_small`   | temporal pooling  | 16           |

pub mod classifier;

pub use classifier::{ModelOutput, VideoClassifier, VideoClassifierConfig};

use burn::tensor::backend::Backend;
use tracing::info;

use crate::config::RunConfig;
use crate::utils::error::{Result, SslError};

const MODEL_ZOO: [(&str, bool, usize); 4] = [
    ("sifar_tiny", true, 8),
    ("sifar_small", true, 16),
    ("tsn_tiny", false, 8),
    ("tsn_small", false, 16),
];

pub fn is_known_model(name: &str) -> bool {
    MODEL_ZOO.iter().any(|(known, _, _)| *known == name)
}

/// Architecture config for a resolved run configuration
pub fn model_config(config: &RunConfig) -> Result<VideoClassifierConfig> {
    let (_, super_image, base_filters) = MODEL_ZOO
        .iter()
        .find(|(name, _, _)| *name == config.model.model)
        .copied()
        .ok_or_else(|| SslError::Config(format!("Unknown model '{}'", config.model.model)))?;
    if config.model.num_classes == 0 {
        return Err(SslError::Model("Class count not resolved".into()));
    }

    Ok(VideoClassifierConfig::new(config.model.num_classes)
        .with_in_channels(config.model.input_channels)
        .with_super_img_rows(if super_image { config.model.super_img_rows.max(1) } else { 0 })
        .with_base_filters(base_filters)
        .with_embedding_dim(config.model.embedding_dim)
        .with_num_branches(config.model_branches())
        .with_dropout_rate(config.model.drop))
}

/// Build the model named by the configuration
pub fn create_model<B: Backend>(config: &RunConfig, device: &B::Device) -> Result<VideoClassifier<B>> {
    let model_config = model_config(config)?;
    let model = model_config.init(device);
    info!(
        "Creating model {} ({} classes, {} branch(es))",
        config.model.model,
        model_config.num_classes,
        model_config.num_branches
    );
    Ok(model)
}
