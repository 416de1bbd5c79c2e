//! Evaluation over the validation loader
//!
//! Logits are averaged over the views of a sample (crops x clips) before the
//! loss and accuracies are taken.

use burn::tensor::{backend::Backend, ElementConversion, Tensor};

use crate::dataset::loader::ClipLoader;
use crate::model::VideoClassifier;
use crate::training::criterion::{PrimaryCriterion, Targets};
use crate::training::to_host;
use crate::utils::error::Result;
use crate::utils::logging::progress_bar;
use crate::utils::metrics::{argmax, topk_correct, ConfusionMatrix, MetricLogger};

/// Result of one evaluation pass
#[derive(Debug, Clone, PartialEq)]
pub struct TestStats {
    pub loss: f64,
    pub acc1: f64,
    pub acc5: f64,
    pub num_samples: usize,
    /// Accuracy per class in percent, `None` for classes absent from the set
    pub per_class: Option<Vec<Option<f64>>>,
}

impl TestStats {
    /// `(name, value)` pairs logged as `test_<name>`
    pub fn metrics(&self) -> Vec<(String, f64)> {
        vec![
            ("loss".to_string(), self.loss),
            ("acc1".to_string(), self.acc1),
            ("acc5".to_string(), self.acc5),
        ]
    }
}

/// Evaluate `model` on every batch of `loader`
pub fn evaluate<B: Backend>(
    model: &VideoClassifier<B>,
    loader: &ClipLoader,
    classwise: bool,
    show_progress: bool,
    device: &B::Device,
) -> Result<TestStats> {
    let num_classes = model.num_classes();
    let mut metrics = MetricLogger::new();
    let mut confusion = ConfusionMatrix::new(num_classes);
    let mut num_samples = 0;
    let pb = progress_bar(loader.num_batches(), "Test", !show_progress);

    for batch in loader.iter(0) {
        let batch = batch?;
        let n = batch.len();
        let views = batch.num_views();

        let mut logits: Option<Tensor<B, 2>> = None;
        for view in 0..views {
            let out = model.forward(batch.view_tensor::<B>(view, device)).logits;
            logits = Some(match logits {
                Some(acc) => acc + out,
                None => out,
            });
        }
        let Some(logits) = logits else {
            continue;
        };
        let logits = logits / views as f64;

        let loss: f64 = PrimaryCriterion::Plain
            .forward(logits.clone(), &Targets::Hard(batch.labels.clone()))
            .into_scalar()
            .elem();
        let host = to_host(logits, "evaluation logits")?;

        let top1 = topk_correct(&host, num_classes, &batch.labels, 1);
        let top5 = topk_correct(&host, num_classes, &batch.labels, 5);
        metrics.update("loss", loss, n);
        metrics.update("acc1", 100.0 * top1 as f64 / n as f64, n);
        metrics.update("acc5", 100.0 * top5 as f64 / n as f64, n);

        if classwise {
            for (row, &label) in host.chunks(num_classes).zip(batch.labels.iter()) {
                confusion.add(label, argmax(row));
            }
        }
        num_samples += n;
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(TestStats {
        loss: metrics.get("loss").unwrap_or(0.0),
        acc1: metrics.get("acc1").unwrap_or(0.0),
        acc5: metrics.get("acc5").unwrap_or(0.0),
        num_samples,
        per_class: classwise.then(|| {
            confusion
                .per_class_accuracy()
                .into_iter()
                .map(|acc| acc.map(|a| a * 100.0))
                .collect()
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use burn::backend::NdArray;

    use crate::dataset::synthetic::SyntheticClips;
    use crate::model::VideoClassifierConfig;

    type TestBackend = NdArray;

    fn setup(views: usize) -> (VideoClassifier<TestBackend>, ClipLoader) {
        let device = Default::default();
        let model = VideoClassifierConfig::new(3)
            .with_super_img_rows(2)
            .with_embedding_dim(8)
            .init::<TestBackend>(&device);
        let source = SyntheticClips::new(7, 3, [3, 4, 8, 8], views, 2);
        let loader = ClipLoader::new(Arc::new(source), 3, false, false, 0, 1).unwrap();
        (model, loader)
    }

    #[test]
    fn test_counts_every_sample() {
        let (model, loader) = setup(1);
        let stats = evaluate(&model, &loader, false, false, &Default::default()).unwrap();
        assert_eq!(stats.num_samples, 7);
        assert!(stats.loss.is_finite());
        assert!((0.0..=100.0).contains(&stats.acc1));
        // three classes, so top-5 covers everything
        assert_eq!(stats.acc5, 100.0);
        assert!(stats.per_class.is_none());
    }

    #[test]
    fn test_multi_view_and_classwise() {
        let (model, loader) = setup(2);
        let stats = evaluate(&model, &loader, true, false, &Default::default()).unwrap();
        let per_class = stats.per_class.unwrap();
        assert_eq!(per_class.len(), 3);
        assert!(per_class.iter().flatten().all(|a| (0.0..=100.0).contains(a)));
    }
}
