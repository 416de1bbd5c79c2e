//! Run driver
//!
//! Builds every object of a run in a fixed order (registry, logger, seed,
//! model, EMA, optimizer, schedule, loaders, resume) and then either
//! evaluates once or runs the epoch loop:
//! train → step the schedule → evaluate → checkpoint → log line.

use std::collections::BTreeMap;
use std::time::Instant;

use burn::{
    module::{AutodiffModule, Module},
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, AdamConfig, AdamWConfig, Optimizer, SgdConfig,
    },
    tensor::backend::AutodiffBackend,
};
use colored::Colorize;
use tracing::{error, info};

use crate::config::{OptimizerKind, RunConfig};
use crate::dataset::{build_sources, ClipLoader, DatasetEntry, DatasetRegistry};
use crate::model::{create_model, VideoClassifier};
use crate::training::checkpoint::{decode_module, persist, restore, BestTracker, CheckpointFile};
use crate::training::composition::LossPlan;
use crate::training::ema::ShadowModel;
use crate::training::evaluator::{evaluate, TestStats};
use crate::training::mixup::Mixup;
use crate::training::scaler::LossScaler;
use crate::training::scheduler::{EpochScheduler, LRScheduler};
use crate::training::trainer::{empty_unlabeled, DivergenceGuard, EpochPolicy, Learner};
use crate::utils::diagnostics::{DiagnosticHook, RunSnapshot, TracingDiagnostics};
use crate::utils::error::{Result, SslError};
use crate::utils::logging::{epoch_record, format_duration, LogConfig, RunLogger};

/// Outcome of a finished run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub start_epoch: usize,
    pub epochs_trained: usize,
    pub max_accuracy: f64,
    pub last_test: Option<TestStats>,
    pub n_parameters: usize,
}

/// Run training (or a single evaluation) with the default diagnostics hook
pub fn run<B: AutodiffBackend>(config: RunConfig) -> Result<RunSummary> {
    run_with_hook::<B>(config, &TracingDiagnostics)
}

pub fn run_with_hook<B: AutodiffBackend>(mut config: RunConfig, hook: &dyn DiagnosticHook) -> Result<RunSummary> {
    let mut registry = DatasetRegistry::builtin();
    if let Some(path) = &config.data.dataset_config {
        registry.extend_from_toml(path)?;
    }
    let entry = config.resolve(&registry)?;

    let logger = RunLogger::install(&LogConfig {
        level: config.run.log_level,
        ansi_colors: true,
        output_dir: config.run.output_dir.clone(),
    })?;
    logger.write_args(&config)?;

    let result = build_and_run::<B>(&config, &entry, &logger, hook);
    if let Err(err) = &result {
        error!("Run failed: {}", err);
        if !matches!(err, SslError::Divergence { .. }) {
            hook.dump(&err.to_string(), &RunSnapshot::default());
        }
    }
    result
}

fn build_and_run<B: AutodiffBackend>(
    config: &RunConfig,
    entry: &DatasetEntry,
    logger: &RunLogger,
    hook: &dyn DiagnosticHook,
) -> Result<RunSummary> {
    let device = B::Device::default();
    B::seed(config.process_seed());
    info!("Device: {:?}", device);

    let mut model = create_model::<B>(config, &device)?;
    if let Some(source) = &config.model.initial_checkpoint {
        let checkpoint = CheckpointFile::read(source)?;
        model = if config.model.finetune {
            info!("Finetuning from {}, classifier heads reinitialised", source);
            let donor = decode_module::<B, _>(model.clone(), &checkpoint.model, &device, source)?;
            model.with_backbone_of(donor)
        } else {
            info!("Initial weights from {}", source);
            decode_module::<B, _>(model, &checkpoint.model, &device, source)?
        };
    }
    let n_parameters = model.num_params();
    info!("Number of params: {}", n_parameters);

    let ema = config
        .use_ema()
        .then(|| ShadowModel::new(model.valid(), config.model.model_ema_decay));
    if let Some(ema) = &ema {
        info!("Model EMA with decay {}", ema.decay());
    }

    let o = &config.optim;
    let (beta_1, beta_2) = match o.opt_betas.as_deref() {
        Some([b1, b2]) => (*b1 as f32, *b2 as f32),
        _ => (0.9, 0.999),
    };
    let session = Run {
        config,
        entry,
        logger,
        hook,
        device: &device,
        n_parameters,
    };
    match o.opt {
        OptimizerKind::Adamw => {
            let optimizer = AdamWConfig::new()
                .with_beta_1(beta_1)
                .with_beta_2(beta_2)
                .with_epsilon(o.opt_eps as f32)
                .with_weight_decay(o.weight_decay as f32)
                .init::<B, VideoClassifier<B>>();
            session.train(model, ema, optimizer)
        }
        OptimizerKind::Adam => {
            let optimizer = AdamConfig::new()
                .with_beta_1(beta_1)
                .with_beta_2(beta_2)
                .with_epsilon(o.opt_eps as f32)
                .with_weight_decay(Some(WeightDecayConfig::new(o.weight_decay)))
                .init::<B, VideoClassifier<B>>();
            session.train(model, ema, optimizer)
        }
        OptimizerKind::Sgd => {
            let optimizer = SgdConfig::new()
                .with_weight_decay(Some(WeightDecayConfig::new(o.weight_decay)))
                .with_momentum(Some(MomentumConfig::new().with_momentum(o.momentum)))
                .init::<B, VideoClassifier<B>>();
            session.train(model, ema, optimizer)
        }
    }
}

struct Run<'a, B: AutodiffBackend> {
    config: &'a RunConfig,
    entry: &'a DatasetEntry,
    logger: &'a RunLogger,
    hook: &'a dyn DiagnosticHook,
    device: &'a B::Device,
    n_parameters: usize,
}

impl<B: AutodiffBackend> Run<'_, B> {
    fn train<O>(
        &self,
        model: VideoClassifier<B>,
        ema: Option<ShadowModel<VideoClassifier<B::InnerBackend>>>,
        optimizer: O,
    ) -> Result<RunSummary>
    where
        O: Optimizer<VideoClassifier<B>, B>,
    {
        let config = self.config;
        let device = self.device;
        let show_progress = !config.run.no_progress;

        let mut scheduler = EpochScheduler::new(LRScheduler::from_config(config));
        let plan = LossPlan::from_config(config);

        let sources = build_sources(config, self.entry)?;
        let seed = config.process_seed();
        let workers = config.data.num_workers;
        let drop_last = config.data.drop_last;
        let labeled = ClipLoader::new(sources.labeled, config.run.batch_size, true, drop_last, seed, workers)?;
        let unlabeled = ClipLoader::new(
            sources.unlabeled,
            config.unlabeled_batch_size(),
            true,
            drop_last,
            seed.wrapping_add(1),
            workers,
        )?;
        let val = ClipLoader::new(sources.val, config.run.test_batch_size, false, false, seed, workers)?;
        let num_val = val.num_samples();
        if plan.unlabeled.any() && !config.eval_only() && unlabeled.num_batches() == 0 {
            return Err(empty_unlabeled(&unlabeled));
        }

        let mut learner = Learner {
            model,
            optimizer,
            ema,
            scaler: LossScaler::new(config.use_amp()),
            optimizer_steps: 0,
        };
        let mut start_epoch = config.run.start_epoch;
        let mut best = BestTracker::new(0.0);
        if let Some(source) = config.resume_source() {
            let checkpoint = CheckpointFile::read(&source)?;
            let (resumed, restored) = restore(&checkpoint, &source, learner, &mut scheduler, config, device)?;
            learner = resumed;
            if let Some(epoch) = restored.start_epoch {
                start_epoch = epoch;
            }
            if let Some(max_accuracy) = restored.max_accuracy {
                best = BestTracker::new(max_accuracy);
            }
        }

        if config.eval_only() {
            let stats = evaluate(&learner.model.valid(), &val, config.run.classwise_eval, show_progress, device)?;
            println!("Accuracy of the network on the {} test images: {:.1}%", num_val, stats.acc1);
            if let Some(per_class) = &stats.per_class {
                for (class, acc) in per_class.iter().enumerate() {
                    match acc {
                        Some(acc) => println!("  class {:>4}: {:.1}%", class, acc),
                        None => println!("  class {:>4}: {}", class, "no samples".dimmed()),
                    }
                }
            }
            return Ok(RunSummary {
                start_epoch,
                epochs_trained: 0,
                max_accuracy: best.max_accuracy(),
                last_test: Some(stats),
                n_parameters: self.n_parameters,
            });
        }

        info!("Loss: {}", plan.describe());
        info!("Schedule: {}", scheduler.schedule().description());
        println!(
            "{}",
            format!("Start training, current max acc is {:.2}", best.max_accuracy())
                .green()
                .bold()
        );

        let mut mixup = Mixup::from_config(config, seed);
        let mut guard = DivergenceGuard::new(config.run.divergence_patience);
        let policy = EpochPolicy {
            plan: &plan,
            clip_grad: config.optim.clip_grad,
            show_progress,
            hook: self.hook,
        };

        let started = Instant::now();
        let mut last_test = None;
        let mut epochs_trained = 0;
        for epoch in start_epoch..config.run.epochs {
            let epoch_started = Instant::now();
            let lr = scheduler.current_lr() * config.lr_multiplier(epoch);
            let train = policy.train_one_epoch(
                &mut learner,
                mixup.as_mut(),
                &labeled,
                &unlabeled,
                epoch,
                lr,
                &mut guard,
                device,
            )?;
            info!(
                "Epoch: {}, Time: {:.2} min, lr {:.3e}",
                epoch,
                epoch_started.elapsed().as_secs_f64() / 60.0,
                lr
            );
            scheduler.step(epoch);

            let test = evaluate(&learner.model.valid(), &val, false, show_progress, device)?;
            println!("Accuracy of the network on the {} test images: {:.1}%", num_val, test.acc1);
            let is_best = best.observe(test.acc1);
            println!("Max accuracy: {:.2}%", best.max_accuracy());

            if let Some(dir) = self.logger.output_dir() {
                let checkpoint = CheckpointFile::capture(&learner, &scheduler, epoch, best.max_accuracy(), config)?;
                persist(&checkpoint, dir, is_best)?;
            }
            let test_metrics: BTreeMap<String, f64> = test.metrics().into_iter().collect();
            self.logger
                .append_stats(&epoch_record(&train.metrics, &test_metrics, epoch, self.n_parameters))?;

            last_test = Some(test);
            epochs_trained += 1;
        }

        println!(
            "{} {}",
            "Training time".cyan(),
            format_duration(started.elapsed().as_secs())
        );
        Ok(RunSummary {
            start_epoch,
            epochs_trained,
            max_accuracy: best.max_accuracy(),
            last_test,
            n_parameters: self.n_parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn config(output_dir: &Path, extra: &[&str]) -> RunConfig {
        let dir = output_dir.to_str().unwrap();
        let mut args = vec![
            "ssl_sifar", "--dataset", "synthetic", "--input_size", "8", "--duration", "4",
            "--super_img_rows", "2", "--embedding-dim", "8", "-b", "8", "--test-batch-size", "8",
            "--sup_thresh", "1", "--simclr_w", "0.5", "--use-pl-loss", "--no-progress", "-j", "1",
            "--output_dir", dir,
        ];
        args.extend_from_slice(extra);
        RunConfig::try_from_args(args).unwrap()
    }

    fn log_lines(dir: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(dir.join("log.txt"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_two_epochs_write_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let summary = run::<TestBackend>(config(dir.path(), &["--epochs", "2"])).unwrap();

        assert_eq!(summary.epochs_trained, 2);
        assert!(summary.n_parameters > 0);
        for name in ["args", "checkpoint.pth", "model_best.pth", "log.txt", "logs.log"] {
            assert!(dir.path().join(name).exists(), "missing {}", name);
        }

        let lines = log_lines(dir.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 1);
        assert!(lines[0]["train_loss"].is_number());
        assert!(lines[0]["test_acc1"].is_number());
        // unlabeled terms start at sup_thresh
        assert!(lines[0].get("train_loss_simclr").is_none());
        assert!(lines[1]["train_loss_simclr"].is_number());

        let checkpoint = CheckpointFile::read(dir.path().join("checkpoint.pth").to_str().unwrap()).unwrap();
        assert_eq!(checkpoint.epoch, Some(1));
        assert!(checkpoint.model_ema.is_some());
        assert_eq!(checkpoint.max_accuracy, Some(summary.max_accuracy));
    }

    #[test]
    fn test_auto_resume_continues_after_last_epoch() {
        let dir = tempfile::tempdir().unwrap();
        run::<TestBackend>(config(dir.path(), &["--epochs", "1"])).unwrap();
        let summary = run::<TestBackend>(config(dir.path(), &["--epochs", "2", "--auto_resume"])).unwrap();

        assert_eq!(summary.start_epoch, 1);
        assert_eq!(summary.epochs_trained, 1);
        let lines = log_lines(dir.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 1);
    }

    #[test]
    fn test_eval_only_skips_training() {
        let dir = tempfile::tempdir().unwrap();
        run::<TestBackend>(config(dir.path(), &["--epochs", "1"])).unwrap();
        let resume = dir.path().join("checkpoint.pth");
        let summary = run::<TestBackend>(config(
            dir.path(),
            &["--epochs", "5", "--classwise-eval", "--resume", resume.to_str().unwrap()],
        ))
        .unwrap();

        assert_eq!(summary.epochs_trained, 0);
        let stats = summary.last_test.unwrap();
        assert_eq!(stats.num_samples, 16);
        assert_eq!(stats.per_class.map(|p| p.len()), Some(4));
        assert_eq!(log_lines(dir.path()).len(), 1);
    }

    #[test]
    fn test_sgd_without_ema_or_amp() {
        let dir = tempfile::tempdir().unwrap();
        let summary = run::<TestBackend>(config(
            dir.path(),
            &["--epochs", "1", "--opt", "sgd", "--no-model-ema", "--no-amp", "--dml_w", "0.5"],
        ))
        .unwrap();
        assert_eq!(summary.epochs_trained, 1);
        let checkpoint = CheckpointFile::read(dir.path().join("checkpoint.pth").to_str().unwrap()).unwrap();
        assert!(checkpoint.model_ema.is_none());
    }

    #[test]
    fn test_same_seed_runs_log_the_same_epochs() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let extra = ["--epochs", "2", "--seed", "3"];
        run::<TestBackend>(config(first.path(), &extra)).unwrap();
        run::<TestBackend>(config(second.path(), &extra)).unwrap();

        let a = log_lines(first.path());
        let b = log_lines(second.path());
        assert_eq!(a.len(), 2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unlabeled_terms_without_unlabeled_batches_fail() {
        let dir = tempfile::tempdir().unwrap();
        // 48 unlabeled clips never fill a batch of 8 x 7 with drop-last
        let err = run::<TestBackend>(config(dir.path(), &["--epochs", "2", "--mu", "7", "--drop-last"])).unwrap_err();
        assert!(matches!(err, SslError::Dataset(_)));
        assert!(!dir.path().join("log.txt").exists());
    }

    #[test]
    fn test_unknown_dataset_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), &[]);
        config.data.dataset = "nope".to_string();
        let err = run::<TestBackend>(config).unwrap_err();
        assert!(matches!(err, SslError::Config(_)));
    }
}
