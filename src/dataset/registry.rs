//! Dataset registry
//!
//! Maps a dataset name to its class count and the file names of its label
//! lists. The built-in table can be extended from a TOML file:
//!
//! ```toml
//! [datasets.my_clips]
//! num_classes = 12
//! train_label_list = "my_train_lb.txt"
//! train_unlabel_list = "my_train_ulb.txt"
//! val_list = "my_val.txt"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::{Result, SslError};

/// Sample counts of the built-in synthetic dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticSizes {
    pub labeled: usize,
    pub unlabeled: usize,
    pub val: usize,
}

/// Everything the loaders need to know about one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// Number of target classes
    pub num_classes: usize,
    /// Labeled training list, relative to `--list_root`
    pub train_label_list: String,
    /// Unlabeled training list, relative to `--list_root`
    pub train_unlabel_list: String,
    /// Validation list, relative to `--list_root`
    pub val_list: String,
    /// Field separator inside the list files
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Frame file name template for RGB frames
    #[serde(default = "default_image_tmpl")]
    pub image_tmpl: String,
    /// Frame file name template for optical flow frames
    #[serde(default = "default_flow_tmpl")]
    pub flow_tmpl: String,
    /// Videos with fewer frames than this are dropped from the lists
    #[serde(default)]
    pub filter_video: usize,
    /// Present only for generated datasets
    #[serde(default)]
    pub synthetic: Option<SyntheticSizes>,
}

fn default_separator() -> String {
    " ".to_string()
}

fn default_image_tmpl() -> String {
    "{:05d}.jpg".to_string()
}

fn default_flow_tmpl() -> String {
    "{}_{:05d}.jpg".to_string()
}

impl DatasetEntry {
    fn video(num_classes: usize, prefix: &str, filter_video: usize) -> Self {
        Self {
            num_classes,
            train_label_list: format!("{}_train_labeled.txt", prefix),
            train_unlabel_list: format!("{}_train_unlabeled.txt", prefix),
            val_list: format!("{}_val.txt", prefix),
            separator: default_separator(),
            image_tmpl: default_image_tmpl(),
            flow_tmpl: default_flow_tmpl(),
            filter_video,
            synthetic: None,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    datasets: BTreeMap<String, DatasetEntry>,
}

/// Named dataset table
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    entries: BTreeMap<String, DatasetEntry>,
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DatasetRegistry {
    /// Registry with the datasets known out of the box
    pub fn builtin() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("st2stv2".to_string(), DatasetEntry::video(174, "st2stv2", 0));
        entries.insert("mini_st2stv2".to_string(), DatasetEntry::video(87, "mini_st2stv2", 0));
        entries.insert("kinetics400".to_string(), DatasetEntry::video(400, "kinetics400", 30));
        entries.insert("mini_kinetics400".to_string(), DatasetEntry::video(200, "mini_kinetics400", 30));
        entries.insert("ucf101".to_string(), DatasetEntry::video(101, "ucf101", 0));
        entries.insert("hmdb51".to_string(), DatasetEntry::video(51, "hmdb51", 0));
        entries.insert("jester".to_string(), DatasetEntry::video(27, "jester", 0));

        let mut synthetic = DatasetEntry::video(4, "synthetic", 0);
        synthetic.synthetic = Some(SyntheticSizes {
            labeled: 32,
            unlabeled: 48,
            val: 16,
        });
        entries.insert("synthetic".to_string(), synthetic);

        Self { entries }
    }

    /// Merge the `[datasets.*]` tables of a TOML file into the registry
    pub fn extend_from_toml<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let file: RegistryFile = toml::from_str(&content).map_err(|e| {
            SslError::Config(format!("Invalid dataset config '{}': {}", path.display(), e))
        })?;

        let added = file.datasets.len();
        for (name, entry) in file.datasets {
            if entry.num_classes == 0 {
                return Err(SslError::Config(format!(
                    "Dataset '{}' declares zero classes",
                    name
                )));
            }
            self.entries.insert(name, entry);
        }

        info!("Loaded {} dataset entries from {:?}", added, path);
        Ok(added)
    }

    /// Look up a dataset by name
    pub fn get(&self, name: &str) -> Result<&DatasetEntry> {
        self.entries.get(name).ok_or_else(|| {
            SslError::Config(format!(
                "Unknown dataset '{}' (known: {})",
                name,
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}
