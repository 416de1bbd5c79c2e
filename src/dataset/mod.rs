//! Dataset Module
//!
//! Label lists, frame decoding, clip augmentation and batched loading for
//! the labeled, unlabeled and validation sources of a run.

pub mod augmentation;
pub mod loader;
pub mod registry;
pub mod split;
pub mod synthetic;
pub mod video;

use std::sync::Arc;

use tracing::info;

pub use loader::{ClipLoader, ClipSample, ClipSource, HostBatch};
pub use registry::{DatasetEntry, DatasetRegistry};
pub use split::{split_list_file, SplitConfig};
pub use synthetic::SyntheticClips;
pub use video::{ClipMode, VideoDataSet, VideoRecord};

use crate::config::RunConfig;
use crate::utils::error::Result;

/// The three sources of a run
pub struct DataSources {
    pub labeled: Arc<dyn ClipSource>,
    /// Two views per sample
    pub unlabeled: Arc<dyn ClipSource>,
    /// `num_crops x num_clips` views per sample
    pub val: Arc<dyn ClipSource>,
}

/// Build the sources described by a resolved configuration
pub fn build_sources(config: &RunConfig, entry: &DatasetEntry) -> Result<DataSources> {
    let data = &config.data;
    let eval_mode = ClipMode::Eval {
        num_crops: data.num_crops,
    };

    let sources = match entry.synthetic {
        Some(sizes) => {
            let dims = [
                data.modality.input_channels(),
                data.duration,
                data.input_size,
                data.input_size,
            ];
            let k = entry.num_classes;
            DataSources {
                labeled: Arc::new(SyntheticClips::new(sizes.labeled, k, dims, 1, 0)),
                unlabeled: Arc::new(SyntheticClips::new(sizes.unlabeled, k, dims, 2, 1)),
                val: Arc::new(SyntheticClips::new(sizes.val, k, dims, config.num_views(), 2)),
            }
        }
        None => {
            let root = config.list_root();
            DataSources {
                labeled: Arc::new(VideoDataSet::new(data, entry, &entry.train_label_list, root, ClipMode::Train)?),
                unlabeled: Arc::new(VideoDataSet::new(
                    data,
                    entry,
                    &entry.train_unlabel_list,
                    root,
                    ClipMode::TwoView,
                )?),
                val: Arc::new(VideoDataSet::new(data, entry, &entry.val_list, root, eval_mode)?),
            }
        }
    };

    info!(
        "Data: {} labeled, {} unlabeled, {} validation clips",
        sources.labeled.len(),
        sources.unlabeled.len(),
        sources.val.len()
    );
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_sources() {
        let mut config = RunConfig::try_from_args([
            "ssl_sifar", "--dataset", "synthetic", "--input_size", "8", "--duration", "4",
            "--num_crops", "3", "--num_clips", "2",
        ])
        .unwrap();
        let entry = config.resolve(&DatasetRegistry::builtin()).unwrap();
        let sources = build_sources(&config, &entry).unwrap();

        assert_eq!(sources.labeled.len(), 32);
        assert_eq!(sources.unlabeled.views(), 2);
        assert_eq!(sources.val.views(), 6);
        assert_eq!(sources.val.clip_dims(), [3, 4, 8, 8]);
    }

    #[test]
    fn test_missing_lists_fail() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().into_owned();
        let mut config =
            RunConfig::try_from_args(["ssl_sifar", "--dataset", "ucf101", "--data_dir", &data_dir]).unwrap();
        let entry = config.resolve(&DatasetRegistry::builtin()).unwrap();
        assert!(build_sources(&config, &entry).is_err());
    }
}
