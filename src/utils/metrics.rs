//! Metrics Module
//!
//! Host-side metric helpers shared by training and evaluation:
//! - Weighted running averages grouped by name
//! - Top-k accuracy over row-major logits
//! - Confusion matrix with per-class accuracy

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Running average weighted by sample count
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value that stands for `n` samples
    pub fn add(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Named running averages for one pass over a loader
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: BTreeMap<String, RunningAverage>,
}

impl MetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, name: &str, value: f64, n: usize) {
        self.meters.entry(name.to_string()).or_default().add(value, n);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(RunningAverage::average)
    }

    /// Averages of every meter
    pub fn averages(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.average()))
            .collect()
    }

    /// One-line summary for logging
    pub fn summary(&self) -> String {
        self.meters
            .iter()
            .map(|(name, meter)| format!("{}: {:.4}", name, meter.average()))
            .collect::<Vec<_>>()
            .join("  ")
    }
}

/// Index of the largest value
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best, best_v)
            }
        })
        .0
}

/// Number of rows whose label is among the `k` highest logits
///
/// `logits` is row-major with `num_classes` columns.
pub fn topk_correct(logits: &[f32], num_classes: usize, labels: &[usize], k: usize) -> usize {
    let k = k.min(num_classes);
    logits
        .chunks(num_classes)
        .zip(labels.iter())
        .filter(|(row, &label)| {
            let target = row[label];
            let higher = row.iter().filter(|&&v| v > target).count();
            higher < k
        })
        .count()
}

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Number of classes
    pub num_classes: usize,

    /// Row = actual, column = predicted, row-major
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    /// Add a single prediction to the matrix
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    /// Diagonal sum
    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total > 0 {
            self.correct() as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Recall of every class; `None` for classes without samples
    pub fn per_class_accuracy(&self) -> Vec<Option<f64>> {
        (0..self.num_classes)
            .map(|row| {
                let support: usize = (0..self.num_classes).map(|col| self.get(row, col)).sum();
                if support > 0 {
                    Some(self.get(row, row) as f64 / support as f64)
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average_weighted() {
        let mut avg = RunningAverage::new();
        avg.add(1.0, 1);
        avg.add(4.0, 3);
        assert!((avg.average() - 3.25).abs() < 1e-12);
        assert_eq!(avg.count(), 4);
        assert_eq!(RunningAverage::new().average(), 0.0);
    }

    #[test]
    fn test_metric_logger() {
        let mut logger = MetricLogger::new();
        logger.update("loss", 2.0, 2);
        logger.update("loss", 1.0, 2);
        logger.update("acc1", 50.0, 4);
        let averages = logger.averages();
        assert!((averages["loss"] - 1.5).abs() < 1e-12);
        assert_eq!(averages["acc1"], 50.0);
        assert!(logger.summary().contains("loss: 1.5000"));
    }

    #[test]
    fn test_topk_correct() {
        // Three rows, four classes
        let logits = [
            0.1, 0.9, 0.0, 0.0, // top1 = 1
            0.5, 0.4, 0.3, 0.2, // label 2 is third
            0.0, 0.0, 0.0, 1.0, // top1 = 3
        ];
        let labels = [1, 2, 0];
        assert_eq!(topk_correct(&logits, 4, &labels, 1), 1);
        assert_eq!(topk_correct(&logits, 4, &labels, 3), 2);
        assert_eq!(topk_correct(&logits, 4, &labels, 5), 3);
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[3.0]), 0);
    }

    #[test]
    fn test_confusion_matrix_per_class() {
        let mut cm = ConfusionMatrix::new(3);
        cm.add(0, 0);
        cm.add(0, 1);
        cm.add(1, 1);
        assert_eq!(cm.total(), 3);
        assert_eq!(cm.correct(), 2);
        let per_class = cm.per_class_accuracy();
        assert_eq!(per_class[0], Some(0.5));
        assert_eq!(per_class[1], Some(1.0));
        assert_eq!(per_class[2], None);
    }
}
