//! Epoch training policy
//!
//! One call of [`EpochPolicy::train_one_epoch`] walks the labeled loader once.
//! The unlabeled loader is cycled alongside it while the unlabeled terms are
//! active. Each step composes a single scalar loss, backpropagates it once and
//! then either applies the optimizer step (followed by the EMA update) or
//! skips it on a non-finite loss or a gradient overflow.

use std::collections::BTreeMap;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use tracing::{debug, warn};

use crate::dataset::loader::{ClipLoader, HostBatch};
use crate::model::VideoClassifier;
use crate::training::composition::{LossComposition, LossPlan};
use crate::training::contrastive::{branch_divergence, byol, info_nce, simsiam};
use crate::training::criterion::Targets;
use crate::training::ema::ShadowModel;
use crate::training::mixup::Mixup;
use crate::training::scaler::{clip_grad_norm, LossScaler};
use crate::training::to_host;
use crate::utils::diagnostics::{DiagnosticHook, RunSnapshot};
use crate::utils::error::{Result, SslError};
use crate::utils::logging::progress_bar;
use crate::utils::metrics::{topk_correct, MetricLogger};

/// Escalates a run of consecutive non-finite losses into a fatal error
#[derive(Debug, Clone)]
pub struct DivergenceGuard {
    patience: usize,
    consecutive: usize,
    skipped: usize,
}

impl DivergenceGuard {
    pub fn new(patience: usize) -> Self {
        Self {
            patience: patience.max(1),
            consecutive: 0,
            skipped: 0,
        }
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    /// Non-finite steps skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Record whether the loss of a step was finite
    pub fn observe(&mut self, finite: bool, epoch: usize, step: usize) -> Result<()> {
        if finite {
            self.consecutive = 0;
            return Ok(());
        }
        self.consecutive += 1;
        self.skipped += 1;
        if self.consecutive >= self.patience {
            return Err(SslError::Divergence {
                epoch,
                step,
                consecutive: self.consecutive,
            });
        }
        Ok(())
    }
}

/// Everything that changes during training
pub struct Learner<B: AutodiffBackend, O> {
    pub model: VideoClassifier<B>,
    pub optimizer: O,
    pub ema: Option<ShadowModel<VideoClassifier<B::InnerBackend>>>,
    pub scaler: LossScaler,
    /// Optimizer steps applied since the run (or the resumed run) started
    pub optimizer_steps: usize,
}

/// Summary of one training epoch
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    /// Running averages, logged as `train_<name>`
    pub metrics: BTreeMap<String, f64>,
    pub steps: usize,
    pub skipped_steps: usize,
    pub overflow_steps: usize,
    /// Positions at which the unlabeled loader was restarted
    pub unlabeled_restarts: Vec<usize>,
}

impl EpochStats {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepStatus {
    Applied,
    NonFinite,
    Overflow,
}

/// Per-run settings of the epoch loop
pub struct EpochPolicy<'a> {
    pub plan: &'a LossPlan,
    /// Global gradient norm limit
    pub clip_grad: Option<f64>,
    pub show_progress: bool,
    pub hook: &'a dyn DiagnosticHook,
}

fn split_rows<B: AutodiffBackend>(x: Tensor<B, 2>, m: usize) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [n, d] = x.dims();
    (x.clone().slice([0..m, 0..d]), x.slice([m..n, 0..d]))
}

pub(crate) fn empty_unlabeled(loader: &ClipLoader) -> SslError {
    SslError::Dataset(format!(
        "Unlabeled terms are enabled but the unlabeled loader yields no batch ({} clips)",
        loader.num_samples()
    ))
}

fn scalar<B: AutodiffBackend>(t: &Tensor<B, 1>) -> f64 {
    t.clone().into_scalar().elem::<f64>()
}

impl EpochPolicy<'_> {
    #[allow(clippy::too_many_arguments)]
    pub fn train_one_epoch<B, O>(
        &self,
        learner: &mut Learner<B, O>,
        mut mixup: Option<&mut Mixup>,
        labeled: &ClipLoader,
        unlabeled: &ClipLoader,
        epoch: usize,
        lr: f64,
        guard: &mut DivergenceGuard,
        device: &B::Device,
    ) -> Result<EpochStats>
    where
        B: AutodiffBackend,
        O: Optimizer<VideoClassifier<B>, B>,
    {
        let mut metrics = MetricLogger::new();
        let mut stats = EpochStats::default();
        let mut snapshot = RunSnapshot {
            epoch,
            learning_rate: lr,
            ..Default::default()
        };

        let use_unlabeled = self.plan.unlabeled_active(epoch);
        if use_unlabeled && unlabeled.num_batches() == 0 {
            return Err(empty_unlabeled(unlabeled));
        }
        let mut unlabeled_batches = unlabeled.cycle(epoch as u64);
        let pb = progress_bar(labeled.num_batches(), &format!("Epoch {}", epoch), !self.show_progress);

        for (step, batch) in labeled.iter(epoch as u64).enumerate() {
            let batch = batch?;
            let unlabeled_batch = if use_unlabeled {
                match unlabeled_batches.next() {
                    Some(batch) => Some(batch?),
                    None => return Err(empty_unlabeled(unlabeled)),
                }
            } else {
                None
            };

            snapshot.step = step;
            snapshot.loss_scale = learner.scaler.scale();
            let status = self.step(
                learner,
                mixup.as_deref_mut(),
                &batch,
                unlabeled_batch.as_ref(),
                &mut metrics,
                &mut snapshot,
                lr,
                device,
            )?;

            match status {
                StepStatus::Applied => {}
                StepStatus::NonFinite => {
                    if let Err(err) = guard.observe(false, epoch, step) {
                        snapshot.consecutive_non_finite = guard.consecutive();
                        self.hook.dump("training diverged", &snapshot);
                        pb.abandon();
                        return Err(err);
                    }
                    warn!(
                        "{}, step skipped ({} in a row)",
                        SslError::NonFiniteLoss { epoch, step },
                        guard.consecutive()
                    );
                    stats.skipped_steps += 1;
                }
                StepStatus::Overflow => {
                    debug!(
                        "Gradient overflow at step {}, loss scale now {}",
                        step,
                        learner.scaler.scale()
                    );
                    stats.overflow_steps += 1;
                }
            }
            if status != StepStatus::NonFinite {
                guard.observe(true, epoch, step)?;
            }

            stats.steps += 1;
            pb.inc(1);
            if let Some(loss) = metrics.get("loss") {
                pb.set_message(format!("loss {:.4}", loss));
            }
        }
        pb.finish_and_clear();

        stats.metrics = metrics.averages();
        stats.metrics.insert("lr".to_string(), lr);
        stats.metrics.insert("loss_scale".to_string(), learner.scaler.scale());
        stats.metrics.insert("skipped_steps".to_string(), stats.skipped_steps as f64);
        stats.unlabeled_restarts = unlabeled_batches.restarts().to_vec();
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn step<B, O>(
        &self,
        learner: &mut Learner<B, O>,
        mixup: Option<&mut Mixup>,
        batch: &HostBatch,
        unlabeled: Option<&HostBatch>,
        metrics: &mut MetricLogger,
        snapshot: &mut RunSnapshot,
        lr: f64,
        device: &B::Device,
    ) -> Result<StepStatus>
    where
        B: AutodiffBackend,
        O: Optimizer<VideoClassifier<B>, B>,
    {
        let n = batch.len();
        let x = batch.view_tensor::<B>(0, device);
        let (x, targets) = match mixup {
            Some(mixup) => mixup.apply(x, &batch.labels),
            None => (x, Targets::Hard(batch.labels.clone())),
        };

        let output = learner.model.forward(x);
        let logits = to_host(output.logits.clone().detach(), "training logits")?;
        let correct = topk_correct(&logits, learner.model.num_classes(), &batch.labels, 1);

        let supervised = self.plan.distillation.forward(&self.plan.primary, &output, &targets);
        let mut loss = LossComposition::new(supervised.primary);
        if let (Some(name), Some(kd)) = (self.plan.distillation.name(), supervised.distillation) {
            loss.add(name, self.plan.distillation.weight(), kd);
        }
        let mut mask_ratio = None;
        if let Some(unlabeled) = unlabeled {
            mask_ratio = self.unlabeled_terms(&learner.model, unlabeled, &mut loss, device)?;
        }

        let total = loss.total();
        let total_value = scalar(&total);
        let values = loss.map(scalar);
        snapshot.last_losses = values
            .terms()
            .iter()
            .map(|t| (t.name.to_string(), t.value))
            .chain(std::iter::once(("primary".to_string(), *values.primary())))
            .collect();

        if !total_value.is_finite() {
            return Ok(StepStatus::NonFinite);
        }

        metrics.update("loss", total_value, n);
        metrics.update("loss_ce", *values.primary(), n);
        for term in values.terms() {
            metrics.update(&format!("loss_{}", term.name), term.value, n);
        }
        metrics.update("acc1", 100.0 * correct as f64 / n.max(1) as f64, n);
        if let Some(ratio) = mask_ratio {
            metrics.update("pl_mask", ratio, unlabeled.map_or(0, |u| u.len()));
        }

        let grads = learner.scaler.scale_loss(total).backward();
        let grads = GradientsParams::from_grads(grads, &learner.model);
        let unscaled = learner.scaler.unscale::<B, _>(&learner.model, grads);
        if unscaled.overflow && learner.scaler.is_enabled() {
            learner.scaler.update(true);
            return Ok(StepStatus::Overflow);
        }
        let grads = match self.clip_grad {
            Some(max_norm) => clip_grad_norm::<B, _>(&learner.model, unscaled.grads, unscaled.norm, max_norm),
            None => unscaled.grads,
        };

        learner.model = learner.optimizer.step(lr, learner.model.clone(), grads);
        learner.scaler.update(false);
        learner.optimizer_steps += 1;
        if let Some(ema) = learner.ema.as_mut() {
            ema.update(&learner.model.valid());
        }
        Ok(StepStatus::Applied)
    }

    /// Add the unlabeled terms; returns the pseudo-label mask ratio when that term is on
    fn unlabeled_terms<B: AutodiffBackend>(
        &self,
        model: &VideoClassifier<B>,
        batch: &HostBatch,
        loss: &mut LossComposition<Tensor<B, 1>>,
        device: &B::Device,
    ) -> Result<Option<f64>> {
        let m = batch.len();
        let views = Tensor::cat(vec![batch.view_tensor::<B>(0, device), batch.view_tensor::<B>(1, device)], 0);
        let output = model.forward(views);
        let (logits_a, logits_b) = split_rows(output.logits, m);
        let (embedding_a, embedding_b) = split_rows(output.embedding, m);
        let terms = &self.plan.unlabeled;

        if let Some((weight, simclr)) = terms.simclr {
            let value = simclr.forward(
                embedding_a.clone(),
                embedding_b.clone(),
                logits_a.clone(),
                logits_b.clone(),
            )?;
            loss.add("simclr", weight, value);
        }
        if let Some(weight) = terms.branch_div {
            loss.add("branch_div", weight, branch_divergence(&output.branches));
        }
        if let Some(weight) = terms.simsiam {
            loss.add("simsiam", weight, simsiam(embedding_a.clone(), embedding_b.clone()));
        }
        if let Some((weight, temperature)) = terms.moco {
            loss.add("moco", weight, info_nce(embedding_a.clone(), embedding_b.clone(), temperature));
        }
        if let Some(weight) = terms.byol {
            loss.add("byol", weight, byol(embedding_a, embedding_b));
        }
        match terms.pseudo_label {
            Some(term) => {
                let pl = term.forward(logits_a, logits_b)?;
                loss.add("pl", term.weight, pl.loss);
                Ok(Some(pl.mask_ratio))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use burn::backend::{Autodiff, NdArray};
    use burn::module::Param;
    use burn::optim::AdamConfig;

    use crate::config::RunConfig;
    use crate::dataset::registry::DatasetRegistry;
    use crate::dataset::synthetic::SyntheticClips;
    use crate::model::create_model;
    use crate::training::scaler::ScalerState;
    use crate::utils::diagnostics::TracingDiagnostics;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_three_consecutive_non_finite_diverge() {
        let mut guard = DivergenceGuard::new(3);
        assert!(guard.observe(false, 0, 0).is_ok());
        assert!(guard.observe(false, 0, 1).is_ok());
        let err = guard.observe(false, 0, 2).unwrap_err();
        assert!(matches!(err, SslError::Divergence { consecutive: 3, step: 2, .. }));
    }

    #[test]
    fn test_finite_step_resets_the_run() {
        let mut guard = DivergenceGuard::new(3);
        guard.observe(false, 0, 0).unwrap();
        guard.observe(false, 0, 1).unwrap();
        guard.observe(true, 0, 2).unwrap();
        assert_eq!(guard.consecutive(), 0);
        guard.observe(false, 0, 3).unwrap();
        guard.observe(false, 0, 4).unwrap();
        assert_eq!(guard.skipped(), 4);
    }

    fn tiny_config(args: &[&str]) -> RunConfig {
        let mut full = vec![
            "ssl_sifar", "--dataset", "synthetic", "--input_size", "8", "--duration", "4",
            "--super_img_rows", "2", "--embedding-dim", "8",
        ];
        full.extend_from_slice(args);
        let mut config = RunConfig::try_from_args(full).unwrap();
        config.resolve(&DatasetRegistry::builtin()).unwrap();
        config
    }

    fn learner(config: &RunConfig) -> Learner<TestBackend, impl Optimizer<VideoClassifier<TestBackend>, TestBackend>> {
        let device = Default::default();
        let model = create_model::<TestBackend>(config, &device).unwrap();
        let ema = ShadowModel::new(model.valid(), 0.5);
        Learner {
            model,
            optimizer: AdamConfig::new().init::<TestBackend, VideoClassifier<TestBackend>>(),
            ema: Some(ema),
            scaler: LossScaler::new(config.use_amp()),
            optimizer_steps: 0,
        }
    }

    /// First head weight of the live model and of the EMA
    fn head_weights<O>(learner: &Learner<TestBackend, O>) -> (Vec<f32>, Vec<f32>) {
        let live = to_host(learner.model.heads[0].weight.val(), "live head").unwrap();
        let ema = to_host(learner.ema.as_ref().unwrap().module().heads[0].weight.val(), "ema head").unwrap();
        (live, ema)
    }

    /// NaN biases make every logit, and so every loss, non-finite
    fn poison_heads<O>(learner: &mut Learner<TestBackend, O>) {
        let device = Default::default();
        for head in learner.model.heads.iter_mut() {
            let classes = head.weight.val().dims()[1];
            head.bias = Some(Param::from_tensor(Tensor::full([classes], f32::NAN, &device)));
        }
    }

    fn train_epoch<O: Optimizer<VideoClassifier<TestBackend>, TestBackend>>(
        config: &RunConfig,
        learner: &mut Learner<TestBackend, O>,
        labeled: usize,
        unlabeled: usize,
        guard: &mut DivergenceGuard,
    ) -> Result<EpochStats> {
        let dims = [3, 4, 8, 8];
        let labeled = ClipLoader::new(Arc::new(SyntheticClips::new(labeled, 4, dims, 1, 0)), 2, true, false, 0, 1).unwrap();
        let unlabeled = ClipLoader::new(Arc::new(SyntheticClips::new(unlabeled, 4, dims, 2, 1)), 2, true, false, 0, 1).unwrap();

        let plan = LossPlan::from_config(config);
        let hook = TracingDiagnostics;
        let policy = EpochPolicy {
            plan: &plan,
            clip_grad: Some(5.0),
            show_progress: false,
            hook: &hook,
        };
        let mut mixup = Mixup::from_config(config, 0);
        policy.train_one_epoch(learner, mixup.as_mut(), &labeled, &unlabeled, 0, 1e-3, guard, &Default::default())
    }

    fn run_epoch(config: &RunConfig, labeled: usize, unlabeled: usize) -> (EpochStats, usize, bool) {
        let mut learner = learner(config);
        let (_, before) = head_weights(&learner);
        let stats = train_epoch(config, &mut learner, labeled, unlabeled, &mut DivergenceGuard::new(3)).unwrap();
        let (_, after) = head_weights(&learner);
        (stats, learner.optimizer_steps, before != after)
    }

    #[test]
    fn test_epoch_consumes_every_labeled_batch() {
        let config = tiny_config(&["--sup_thresh", "0", "--simclr_w", "0.5", "--use-pl-loss", "--threshold", "0.0", "--no-amp"]);
        let (stats, steps, ema_moved) = run_epoch(&config, 6, 4);

        assert_eq!(stats.steps, 3);
        assert_eq!(steps, 3);
        assert!(ema_moved);
        // two unlabeled batches per pass
        assert_eq!(stats.unlabeled_restarts, vec![2]);
        assert!(stats.get("loss").unwrap().is_finite());
        assert!(stats.get("loss_simclr").is_some());
        assert!(stats.get("loss_pl").is_some());
        assert!(stats.get("pl_mask").unwrap() > 0.99);
        assert!(stats.get("acc1").unwrap() >= 0.0);
    }

    #[test]
    fn test_unlabeled_source_untouched_during_warmup() {
        let config = tiny_config(&["--simclr_w", "0.5", "--sup_thresh", "5", "--no-amp"]);
        let (stats, _, _) = run_epoch(&config, 6, 2);
        assert!(stats.unlabeled_restarts.is_empty());
        assert!(stats.get("loss_simclr").is_none());
    }

    #[test]
    fn test_distillation_and_mixup_terms_logged() {
        let config = tiny_config(&["--sup_thresh", "0", "--dml_w", "0.5", "--mixup", "0.8", "--no-amp"]);
        let (stats, steps, _) = run_epoch(&config, 4, 2);
        assert_eq!(steps, 2);
        assert!(stats.get("loss_dml").is_some());
    }

    #[test]
    fn test_scaled_steps_apply_with_amp() {
        let config = tiny_config(&["--sup_thresh", "0"]);
        let (stats, steps, _) = run_epoch(&config, 4, 2);
        assert_eq!(steps + stats.overflow_steps, 2);
        assert_eq!(stats.skipped_steps, 0);
    }

    #[test]
    fn test_non_finite_steps_leave_learner_untouched() {
        let config = tiny_config(&["--sup_thresh", "0", "--no-amp"]);
        let mut learner = learner(&config);
        poison_heads(&mut learner);
        let before = head_weights(&learner);

        let mut guard = DivergenceGuard::new(5);
        let stats = train_epoch(&config, &mut learner, 4, 2, &mut guard).unwrap();

        assert_eq!(stats.steps, 2);
        assert_eq!(stats.skipped_steps, 2);
        assert_eq!(stats.get("skipped_steps"), Some(2.0));
        assert!(stats.get("loss").is_none());
        assert_eq!(guard.consecutive(), 2);
        assert_eq!(learner.optimizer_steps, 0);
        assert_eq!(head_weights(&learner), before);
    }

    #[test]
    fn test_consecutive_non_finite_steps_abort_the_epoch() {
        let config = tiny_config(&["--sup_thresh", "0", "--no-amp"]);
        let mut learner = learner(&config);
        poison_heads(&mut learner);
        let before = head_weights(&learner);

        let err = train_epoch(&config, &mut learner, 8, 2, &mut DivergenceGuard::new(3)).unwrap_err();

        assert!(matches!(err, SslError::Divergence { consecutive: 3, step: 2, epoch: 0 }));
        assert_eq!(learner.optimizer_steps, 0);
        assert_eq!(head_weights(&learner), before);
    }

    #[test]
    fn test_overflow_steps_skip_optimizer_and_ema() {
        let config = tiny_config(&["--sup_thresh", "0"]);
        let mut learner = learner(&config);
        // saturates to inf in f32, so every scaled gradient overflows
        learner.scaler.load_state(ScalerState {
            scale: 1e300,
            growth_tracker: 0,
        });
        let before = head_weights(&learner);

        let stats = train_epoch(&config, &mut learner, 4, 2, &mut DivergenceGuard::new(3)).unwrap();

        assert_eq!(stats.overflow_steps, 2);
        assert_eq!(stats.skipped_steps, 0);
        assert_eq!(learner.optimizer_steps, 0);
        assert_eq!(learner.scaler.scale(), 1e300 * 0.25);
        assert_eq!(head_weights(&learner), before);
    }

    #[test]
    fn test_unlabeled_terms_need_unlabeled_batches() {
        let config = tiny_config(&["--sup_thresh", "0", "--simclr_w", "0.5", "--no-amp"]);
        let mut learner = learner(&config);
        let err = train_epoch(&config, &mut learner, 4, 0, &mut DivergenceGuard::new(3)).unwrap_err();
        assert!(matches!(err, SslError::Dataset(_)));
        assert_eq!(learner.optimizer_steps, 0);
    }
}
