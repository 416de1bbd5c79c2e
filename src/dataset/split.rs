//! Labeled/unlabeled list splitting
//!
//! Turns a fully labeled training list into the two lists a semi-supervised
//! run reads: a small labeled list and a large unlabeled one whose labels
//! are ignored during training.
//!
//! ## Strategies
//!
//! - **classwise**: every class is split separately, so the labeled list keeps
//!   the class balance of the full list and holds at least one video per class
//! - **overall**: the whole list is shuffled once and cut at the same ratio
//!
//! The split is deterministic for a given seed.

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SplitStrategy;
use crate::dataset::video::VideoRecord;
use crate::utils::error::{Result, SslError};

/// Configuration for list splitting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Fraction of videos moved to the unlabeled list
    pub unlabeled_fraction: f64,
    pub strategy: SplitStrategy,
    pub seed: u64,
}

impl SplitConfig {
    pub fn new(unlabeled_fraction: f64, strategy: SplitStrategy, seed: u64) -> Result<Self> {
        if !(0.0..=1.0).contains(&unlabeled_fraction) {
            return Err(SslError::Config(
                "Unlabeled fraction must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(Self {
            unlabeled_fraction,
            strategy,
            seed,
        })
    }
}

/// Result of a split, as raw list lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSplit {
    pub labeled: Vec<String>,
    pub unlabeled: Vec<String>,
}

/// Split `(line, label)` pairs
pub fn split_lines(lines: Vec<(String, usize)>, config: &SplitConfig) -> ListSplit {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut split = ListSplit::default();

    match config.strategy {
        SplitStrategy::Overall => {
            let mut lines = lines;
            lines.shuffle(&mut rng);
            let n_unlabeled = (lines.len() as f64 * config.unlabeled_fraction).round() as usize;
            for (i, (line, _)) in lines.into_iter().enumerate() {
                if i < n_unlabeled {
                    split.unlabeled.push(line);
                } else {
                    split.labeled.push(line);
                }
            }
        }
        SplitStrategy::Classwise => {
            let mut by_class: BTreeMap<usize, Vec<String>> = BTreeMap::new();
            for (line, label) in lines {
                by_class.entry(label).or_default().push(line);
            }
            for (_, mut class_lines) in by_class {
                class_lines.shuffle(&mut rng);
                let n = class_lines.len();
                let n_unlabeled = ((n as f64 * config.unlabeled_fraction).round() as usize).min(n - 1);
                for (i, line) in class_lines.into_iter().enumerate() {
                    if i < n_unlabeled {
                        split.unlabeled.push(line);
                    } else {
                        split.labeled.push(line);
                    }
                }
            }
        }
    }

    split
}

/// Split a list file and write `<stem>_labeled.txt` / `<stem>_unlabeled.txt`
pub fn split_list_file<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    out_dir: Q,
    separator: &str,
    config: &SplitConfig,
) -> Result<ListSplit> {
    let input = input.as_ref();
    let content = std::fs::read_to_string(input)?;
    let mut lines = Vec::new();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let record = VideoRecord::parse(line, separator)?;
        lines.push((line.to_string(), record.label));
    }

    let split = split_lines(lines, config);

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "train".to_string());
    let out_dir = out_dir.as_ref();
    std::fs::create_dir_all(out_dir)?;
    std::fs::write(out_dir.join(format!("{}_labeled.txt", stem)), join_lines(&split.labeled))?;
    std::fs::write(out_dir.join(format!("{}_unlabeled.txt", stem)), join_lines(&split.unlabeled))?;

    info!(
        "Split {:?}: {} labeled, {} unlabeled ({:?})",
        input,
        split.labeled.len(),
        split.unlabeled.len(),
        config.strategy
    );
    Ok(split)
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(per_class: &[usize]) -> Vec<(String, usize)> {
        per_class
            .iter()
            .enumerate()
            .flat_map(|(label, &n)| (0..n).map(move |i| (format!("v{}_{} 1 40 {}", label, i, label), label)))
            .collect()
    }

    #[test]
    fn test_classwise_keeps_every_class() {
        let config = SplitConfig::new(0.95, SplitStrategy::Classwise, 0).unwrap();
        let split = split_lines(lines(&[20, 20, 3]), &config);
        assert_eq!(split.labeled.len() + split.unlabeled.len(), 43);
        for label in 0..3 {
            let tag = format!(" {}", label);
            assert!(split.labeled.iter().any(|l| l.ends_with(&tag)));
        }
        // 19 + 19 + 2 unlabeled
        assert_eq!(split.unlabeled.len(), 40);
    }

    #[test]
    fn test_overall_ratio() {
        let config = SplitConfig::new(0.75, SplitStrategy::Overall, 1).unwrap();
        let split = split_lines(lines(&[10, 10]), &config);
        assert_eq!(split.unlabeled.len(), 15);
        assert_eq!(split.labeled.len(), 5);
    }

    #[test]
    fn test_split_is_deterministic() {
        let config = SplitConfig::new(0.5, SplitStrategy::Classwise, 42).unwrap();
        assert_eq!(split_lines(lines(&[8, 8]), &config), split_lines(lines(&[8, 8]), &config));
    }

    #[test]
    fn test_split_list_file_writes_both_lists() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("train.txt");
        let text: Vec<String> = lines(&[4, 4]).into_iter().map(|(l, _)| l).collect();
        std::fs::write(&input, text.join("\n")).unwrap();

        let config = SplitConfig::new(0.5, SplitStrategy::Classwise, 3).unwrap();
        let split = split_list_file(&input, dir.path().join("out"), " ", &config).unwrap();

        let labeled = std::fs::read_to_string(dir.path().join("out/train_labeled.txt")).unwrap();
        assert_eq!(labeled.lines().count(), split.labeled.len());
        assert_eq!(split.labeled.len(), 4);
    }

    #[test]
    fn test_rejects_bad_fraction() {
        assert!(SplitConfig::new(1.5, SplitStrategy::Overall, 0).is_err());
    }
}
