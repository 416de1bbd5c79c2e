//! Run configuration
//!
//! `RunConfig` is the complete flag schema of the trainer. It is parsed once
//! from the command line (or read back from an `args` snapshot), validated by
//! [`RunConfig::resolve`] and then treated as read-only. The only fields
//! written after parsing are the derived class and channel counts.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::dataset::registry::{DatasetEntry, DatasetRegistry};
use crate::model::is_known_model;
use crate::utils::error::{Result, SslError};
use crate::utils::logging::LogLevel;

/// Input modality of the clips
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Rgb,
    Flow,
}

impl Modality {
    /// Channels per sampled frame (flow stacks five x/y pairs)
    pub fn input_channels(self) -> usize {
        match self {
            Modality::Rgb => 3,
            Modality::Flow => 10,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adamw,
    Adam,
    Sgd,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Cosine,
    Step,
    Constant,
}

/// How mixing parameters are drawn; one draw per batch
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixupMode {
    Batch,
}

/// How a full training list is split into labeled and unlabeled parts
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitStrategy {
    Classwise,
    Overall,
}

/// Dataset and input pipeline
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset name from the registry
    #[arg(long, default_value = "st2stv2")]
    pub dataset: String,

    /// Root directory holding the extracted frames
    #[arg(long = "data_dir", default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory holding the label lists (defaults to the data dir)
    #[arg(long = "list_root")]
    pub list_root: Option<PathBuf>,

    /// Extra dataset registry entries (TOML)
    #[arg(long = "dataset-config")]
    pub dataset_config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Modality::Rgb)]
    pub modality: Modality,

    /// Number of frames per clip
    #[arg(long, default_value_t = 8)]
    pub duration: usize,

    /// Uniform sampling: frames per group; dense sampling: sampling stride
    #[arg(long = "frames_per_group", default_value_t = 1)]
    pub frames_per_group: usize,

    #[arg(long = "dense_sampling")]
    pub dense_sampling: bool,

    /// Spatial crop size
    #[arg(long = "input_size", default_value_t = 224)]
    pub input_size: usize,

    /// Crop the input size directly instead of scaling up first
    #[arg(long = "disable_scaleup")]
    pub disable_scaleup: bool,

    /// Shorter-side scale range used by training augmentation
    #[arg(long = "scale_range", num_args = 2, default_values_t = [256, 320])]
    pub scale_range: Vec<usize>,

    #[arg(long = "no_flip")]
    pub no_flip: bool,

    /// Spatial crops per evaluation sample (1, 3, 5 or 10)
    #[arg(long = "num_crops", default_value_t = 1)]
    pub num_crops: usize,

    /// Temporal clips per evaluation sample
    #[arg(long = "num_clips", default_value_t = 1)]
    pub num_clips: usize,

    /// Decoding worker threads
    #[arg(short = 'j', long = "num_workers", default_value_t = 4)]
    pub num_workers: usize,

    #[arg(long = "drop-last")]
    pub drop_last: bool,

    /// Fraction of samples moved to the unlabeled list by `split-lists`
    #[arg(long, default_value_t = 0.95)]
    pub percentage: f64,

    #[arg(long, value_enum, default_value_t = SplitStrategy::Classwise)]
    pub strategy: SplitStrategy,
}

/// Model zoo selection
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name (sifar_tiny, sifar_small, tsn_tiny, tsn_small)
    #[arg(long, default_value = "sifar_tiny")]
    pub model: String,

    /// Frames per row of the super image
    #[arg(long = "super_img_rows", default_value_t = 3)]
    pub super_img_rows: usize,

    /// Classifier branches when a branch-based term is enabled
    #[arg(long = "num_branches", default_value_t = 2)]
    pub num_branches: usize,

    /// Dropout before the classifier heads
    #[arg(long, default_value_t = 0.0)]
    pub drop: f64,

    /// Width of the projection embedding
    #[arg(long = "embedding-dim", default_value_t = 128)]
    pub embedding_dim: usize,

    /// Weights to start from before any resume
    #[arg(long = "initial_checkpoint")]
    pub initial_checkpoint: Option<String>,

    /// Keep freshly initialised heads when the initial checkpoint has another class count
    #[arg(long)]
    pub finetune: bool,

    /// Disable the EMA shadow model
    #[arg(long = "no-model-ema")]
    pub no_model_ema: bool,

    #[arg(long = "model-ema-decay", default_value_t = 0.99996)]
    pub model_ema_decay: f64,

    /// Resolved from the dataset registry
    #[arg(skip)]
    pub num_classes: usize,

    /// Resolved from the modality
    #[arg(skip)]
    pub input_channels: usize,
}

/// Optimizer hyperparameters
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    #[arg(long, value_enum, default_value_t = OptimizerKind::Adamw)]
    pub opt: OptimizerKind,

    #[arg(long = "opt-eps", default_value_t = 1e-8)]
    pub opt_eps: f64,

    #[arg(long = "opt-betas", num_args = 2)]
    pub opt_betas: Option<Vec<f64>>,

    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,

    #[arg(long = "weight-decay", default_value_t = 0.05)]
    pub weight_decay: f64,

    /// Global gradient norm limit, applied after unscaling
    #[arg(long = "clip-grad")]
    pub clip_grad: Option<f64>,
}

/// Learning-rate schedule
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[arg(long, value_enum, default_value_t = SchedulerKind::Cosine)]
    pub sched: SchedulerKind,

    #[arg(long, default_value_t = 5e-4)]
    pub lr: f64,

    #[arg(long = "warmup-lr", default_value_t = 1e-6)]
    pub warmup_lr: f64,

    #[arg(long = "warmup-epochs", default_value_t = 0)]
    pub warmup_epochs: usize,

    /// Cosine cycles over the run
    #[arg(long = "lr-cycle", default_value_t = 1.0)]
    pub lr_cycle: f64,

    /// Cosine floor
    #[arg(long = "lr-min", default_value_t = 0.0)]
    pub lr_min: f64,

    /// Step schedule period in epochs
    #[arg(long = "decay-t", default_value_t = 50)]
    pub decay_t: usize,

    #[arg(long = "decay-rate", alias = "dr", default_value_t = 0.1)]
    pub decay_rate: f64,

    /// Learning-rate multiplier once the supervised warm-up is over
    #[arg(long = "lr_factor", default_value_t = 0.1)]
    pub lr_factor: f64,

    /// Epochs of supervised-only training
    #[arg(long = "sup_thresh", default_value_t = 25)]
    pub sup_thresh: usize,
}

/// Label smoothing and batch mixing
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    #[arg(long, default_value_t = 0.1)]
    pub smoothing: f64,

    /// Mixup beta alpha; mixup is enabled when > 0
    #[arg(long, default_value_t = 0.0)]
    pub mixup: f64,

    /// Cutmix beta alpha; cutmix is enabled when > 0
    #[arg(long, default_value_t = 0.0)]
    pub cutmix: f64,

    /// Cutmix box ratio bounds, overrides the cutmix alpha
    #[arg(long = "cutmix-minmax", num_args = 2)]
    pub cutmix_minmax: Option<Vec<f64>>,

    #[arg(long = "mixup-prob", default_value_t = 1.0)]
    pub mixup_prob: f64,

    /// Probability of cutmix when both mixup and cutmix are enabled
    #[arg(long = "mixup-switch-prob", default_value_t = 0.5)]
    pub mixup_switch_prob: f64,

    #[arg(long = "mixup-mode", value_enum, default_value_t = MixupMode::Batch)]
    pub mixup_mode: MixupMode,

    /// Do not mix labeled batches while a contrastive term is enabled
    #[arg(long = "contrastive_nomixup")]
    pub contrastive_nomixup: bool,
}

/// Loss weights; every weight > 0 enables its term
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Deep mutual learning between branches
    #[arg(long = "dml_w", default_value_t = 0.0)]
    pub dml_w: f64,

    /// On-the-fly native ensemble distillation
    #[arg(long = "one_w", default_value_t = 0.0)]
    pub one_w: f64,

    /// Branch-to-mixture distillation
    #[arg(long = "mulmix_b", default_value_t = 0.0)]
    pub mulmix_b: f64,

    /// Distillation from the first branch into the others
    #[arg(long = "selfdis_w", default_value_t = 0.0)]
    pub selfdis_w: f64,

    /// Temperature of the distillation terms
    #[arg(long = "kd_temp", default_value_t = 1.0)]
    pub kd_temp: f64,

    /// Instance plus group contrastive term
    #[arg(long = "simclr_w", default_value_t = 0.0)]
    pub simclr_w: f64,

    /// Temperature of the contrastive terms
    #[arg(long, default_value_t = 0.07)]
    pub temperature: f64,

    /// Instance contrastive factor
    #[arg(long, default_value_t = 1.0)]
    pub gamma: f64,

    /// Group contrastive factor
    #[arg(long, default_value_t = 1.0)]
    pub beta: f64,

    #[arg(long = "no-group-loss")]
    pub no_group_loss: bool,

    #[arg(long = "branch_div_w", default_value_t = 0.0)]
    pub branch_div_w: f64,

    #[arg(long = "simsiam_w", default_value_t = 0.0)]
    pub simsiam_w: f64,

    #[arg(long = "moco_w", default_value_t = 0.0)]
    pub moco_w: f64,

    #[arg(long = "byol_w", default_value_t = 0.0)]
    pub byol_w: f64,

    #[arg(long = "use-pl-loss")]
    pub use_pl_loss: bool,

    /// Confidence a prediction must exceed to become a pseudo-label
    #[arg(long, default_value_t = 0.8)]
    pub threshold: f64,

    #[arg(long = "pl_w", default_value_t = 1.0)]
    pub pl_w: f64,
}

/// Loop control, resume and output
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[arg(long, default_value_t = 150)]
    pub epochs: usize,

    #[arg(long = "start_epoch", default_value_t = 0)]
    pub start_epoch: usize,

    #[arg(short = 'b', long = "batch-size", default_value_t = 64)]
    pub batch_size: usize,

    #[arg(long = "test-batch-size", default_value_t = 15)]
    pub test_batch_size: usize,

    /// Unlabeled batch size multiplier
    #[arg(long, default_value_t = 1)]
    pub mu: usize,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    #[arg(long = "local-rank")]
    pub local_rank: Option<u64>,

    #[arg(long = "world_size", default_value_t = 1)]
    pub world_size: usize,

    /// Checkpoint path or URL to resume from
    #[arg(long)]
    pub resume: Option<String>,

    /// Resume from `<output_dir>/checkpoint.pth` when it exists
    #[arg(long = "auto_resume", alias = "auto-resume")]
    pub auto_resume: bool,

    #[arg(long = "no-resume-loss-scaler")]
    pub no_resume_loss_scaler: bool,

    /// Evaluate once and exit
    #[arg(long)]
    pub eval: bool,

    /// Evaluate once with a per-class breakdown and exit
    #[arg(long = "classwise-eval")]
    pub classwise_eval: bool,

    /// Disable dynamic loss scaling
    #[arg(long = "no-amp")]
    pub no_amp: bool,

    #[arg(long = "output_dir")]
    pub output_dir: Option<PathBuf>,

    /// Consecutive non-finite losses tolerated before aborting
    #[arg(long = "divergence-patience", default_value_t = 3)]
    pub divergence_patience: usize,

    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long = "no-progress")]
    pub no_progress: bool,
}

/// Complete, validated run configuration
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[command(flatten)]
    pub data: DataConfig,
    #[command(flatten)]
    pub model: ModelConfig,
    #[command(flatten)]
    pub optim: OptimConfig,
    #[command(flatten)]
    pub schedule: ScheduleConfig,
    #[command(flatten)]
    pub augment: AugmentConfig,
    #[command(flatten)]
    pub loss: LossConfig,
    #[command(flatten)]
    pub run: RunOptions,
}

#[derive(Parser, Debug)]
#[command(name = "ssl_sifar")]
struct ConfigParser {
    #[command(flatten)]
    config: RunConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        ConfigParser::parse_from(["ssl_sifar"]).config
    }
}

impl RunConfig {
    /// Parse a flag list (first item is the program name)
    pub fn try_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        ConfigParser::try_parse_from(args)
            .map(|p| p.config)
            .map_err(|e| SslError::Config(e.to_string()))
    }

    /// Validate the configuration and fill the derived fields
    pub fn resolve(&mut self, registry: &DatasetRegistry) -> Result<DatasetEntry> {
        let entry = registry.get(&self.data.dataset)?.clone();
        self.validate()?;

        self.model.num_classes = entry.num_classes;
        self.model.input_channels = self.data.modality.input_channels();
        Ok(entry)
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SslError::Config(msg));

        if !is_known_model(&self.model.model) {
            return fail(format!("Unknown model '{}'", self.model.model));
        }
        if ![1, 3, 5, 10].contains(&self.data.num_crops) {
            return fail(format!(
                "--num_crops must be one of 1, 3, 5, 10 (got {})",
                self.data.num_crops
            ));
        }
        if self.data.num_clips == 0 || self.data.duration == 0 || self.data.frames_per_group == 0 {
            return fail("--num_clips, --duration and --frames_per_group must be positive".into());
        }
        if self.data.input_size == 0 {
            return fail("--input_size must be positive".into());
        }
        match self.data.scale_range.as_slice() {
            [lo, hi] if lo <= hi && *lo > 0 => {}
            other => return fail(format!("--scale_range needs MIN MAX (got {:?})", other)),
        }
        if !(0.0..=1.0).contains(&self.data.percentage) {
            return fail("--percentage must lie in [0, 1]".into());
        }
        if self.run.batch_size == 0 || self.run.test_batch_size == 0 || self.run.mu == 0 {
            return fail("--batch-size, --test-batch-size and --mu must be positive".into());
        }
        if self.run.world_size != 1 {
            return fail(format!(
                "--world_size {} requested but only single-process training is supported",
                self.run.world_size
            ));
        }
        if self.run.auto_resume && self.run.output_dir.is_none() {
            return fail("--auto_resume requires --output_dir".into());
        }
        if self.run.divergence_patience == 0 {
            return fail("--divergence-patience must be at least 1".into());
        }
        if let Some(betas) = &self.optim.opt_betas {
            if betas.len() != 2 {
                return fail("--opt-betas needs BETA1 BETA2".into());
            }
        }
        if let Some(minmax) = &self.augment.cutmix_minmax {
            match minmax.as_slice() {
                [lo, hi] if 0.0 < *lo && lo < hi && *hi <= 1.0 => {}
                other => {
                    return fail(format!(
                        "--cutmix-minmax needs MIN MAX with 0 < MIN < MAX <= 1 (got {:?})",
                        other
                    ))
                }
            }
        }
        if !(0.0..1.0).contains(&self.augment.smoothing) {
            return fail("--smoothing must lie in [0, 1)".into());
        }
        for (name, p) in [
            ("--mixup-prob", self.augment.mixup_prob),
            ("--mixup-switch-prob", self.augment.mixup_switch_prob),
            ("--threshold", self.loss.threshold),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return fail(format!("{} must lie in [0, 1] (got {})", name, p));
            }
        }
        if !(0.0..1.0).contains(&self.model.model_ema_decay) {
            return fail("--model-ema-decay must lie in [0, 1)".into());
        }
        if self.schedule.lr <= 0.0 || self.schedule.lr_cycle <= 0.0 {
            return fail("--lr and --lr-cycle must be positive".into());
        }
        if self.loss.temperature <= 0.0 || self.loss.kd_temp <= 0.0 {
            return fail("--temperature and --kd_temp must be positive".into());
        }
        Ok(())
    }

    /// Mixup or cutmix is configured at all
    pub fn mixup_enabled(&self) -> bool {
        self.augment.mixup > 0.0 || self.augment.cutmix > 0.0 || self.augment.cutmix_minmax.is_some()
    }

    /// Any unlabeled contrastive-style term is enabled
    pub fn contrastive_enabled(&self) -> bool {
        let l = &self.loss;
        l.simclr_w > 0.0 || l.branch_div_w > 0.0 || l.simsiam_w > 0.0 || l.moco_w > 0.0 || l.byol_w > 0.0
    }

    /// Mixing is applied to labeled batches
    pub fn mixup_active(&self) -> bool {
        self.mixup_enabled() && !(self.augment.contrastive_nomixup && self.contrastive_enabled())
    }

    /// A term reads more than one classifier branch
    pub fn needs_branches(&self) -> bool {
        let l = &self.loss;
        l.dml_w > 0.0 || l.one_w > 0.0 || l.mulmix_b > 0.0 || l.selfdis_w > 0.0 || l.branch_div_w > 0.0
    }

    /// Number of classifier heads the model is built with
    pub fn model_branches(&self) -> usize {
        if self.needs_branches() {
            self.model.num_branches.max(2)
        } else {
            1
        }
    }

    pub fn use_ema(&self) -> bool {
        !self.model.no_model_ema
    }

    pub fn use_amp(&self) -> bool {
        !self.run.no_amp
    }

    pub fn eval_only(&self) -> bool {
        self.run.eval || self.run.classwise_eval
    }

    pub fn rank(&self) -> u64 {
        self.run.local_rank.unwrap_or(0)
    }

    /// Seed of this process
    pub fn process_seed(&self) -> u64 {
        self.run.seed + self.rank()
    }

    pub fn unlabeled_batch_size(&self) -> usize {
        self.run.batch_size * self.run.mu
    }

    /// Evaluation views per sample
    pub fn num_views(&self) -> usize {
        self.data.num_crops * self.data.num_clips
    }

    pub fn list_root(&self) -> &Path {
        self.data.list_root.as_deref().unwrap_or(&self.data.data_dir)
    }

    /// Learning-rate multiplier for `epoch`
    pub fn lr_multiplier(&self, epoch: usize) -> f64 {
        if self.schedule.sup_thresh > 0 && epoch >= self.schedule.sup_thresh {
            self.schedule.lr_factor
        } else {
            1.0
        }
    }

    /// Unlabeled terms contribute from this epoch on
    pub fn unlabeled_terms_active(&self, epoch: usize) -> bool {
        epoch >= self.schedule.sup_thresh
    }

    /// Checkpoint to resume from, if any
    pub fn resume_source(&self) -> Option<String> {
        if let Some(resume) = self.run.resume.as_ref().filter(|r| !r.is_empty()) {
            return Some(resume.clone());
        }
        if self.run.auto_resume {
            let path = self.run.output_dir.as_ref()?.join("checkpoint.pth");
            if path.exists() {
                return Some(path.to_string_lossy().into_owned());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunConfig {
        let mut full = vec!["ssl_sifar"];
        full.extend_from_slice(args);
        RunConfig::try_from_args(full).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.run.batch_size, 64);
        assert_eq!(config.run.epochs, 150);
        assert_eq!(config.data.dataset, "st2stv2");
        assert_eq!(config.optim.opt, OptimizerKind::Adamw);
        assert_eq!(config.schedule.sup_thresh, 25);
        assert!((config.model.model_ema_decay - 0.99996).abs() < 1e-12);
        assert!((config.loss.threshold - 0.8).abs() < 1e-12);
        assert!(config.use_ema());
        assert!(config.use_amp());
        assert_eq!(config.data.scale_range, vec![256, 320]);
    }

    #[test]
    fn test_flag_spellings() {
        let config = parse(&[
            "--data_dir", "/frames", "--batch-size", "4", "--dml_w", "0.5",
            "--use-pl-loss", "--threshold", "0.9", "--auto-resume", "--output_dir", "/out",
            "--cutmix-minmax", "0.2", "0.8", "--no-model-ema",
        ]);
        assert_eq!(config.data.data_dir, PathBuf::from("/frames"));
        assert_eq!(config.run.batch_size, 4);
        assert_eq!(config.loss.dml_w, 0.5);
        assert!(config.loss.use_pl_loss);
        assert!(config.run.auto_resume);
        assert_eq!(config.augment.cutmix_minmax, Some(vec![0.2, 0.8]));
        assert!(!config.use_ema());
    }

    #[test]
    fn test_invalid_choice_is_config_error() {
        let err = RunConfig::try_from_args(["ssl_sifar", "--opt", "lamb"]).unwrap_err();
        assert!(matches!(err, SslError::Config(_)));
    }

    #[test]
    fn test_resolve_fills_derived_fields() {
        let mut config = parse(&["--dataset", "ucf101", "--modality", "flow"]);
        let entry = config.resolve(&DatasetRegistry::builtin()).unwrap();
        assert_eq!(entry.num_classes, 101);
        assert_eq!(config.model.num_classes, 101);
        assert_eq!(config.model.input_channels, 10);
    }

    #[test]
    fn test_resolve_rejects_unknown_dataset() {
        let mut config = parse(&["--dataset", "nope"]);
        assert!(matches!(
            config.resolve(&DatasetRegistry::builtin()),
            Err(SslError::Config(_))
        ));
        assert_eq!(config.model.num_classes, 0);
    }

    #[test]
    fn test_resolve_rejects_bad_values() {
        let registry = DatasetRegistry::builtin();
        for args in [
            vec!["--num_crops", "4"],
            vec!["--auto_resume"],
            vec!["--world_size", "2"],
            vec!["--threshold", "1.5"],
            vec!["--model", "resnet50"],
            vec!["--opt-betas", "0.9", "0.999", "0.5"],
        ] {
            let mut full = vec!["ssl_sifar"];
            full.extend(args.iter().copied());
            let Ok(mut config) = RunConfig::try_from_args(full) else {
                continue;
            };
            assert!(config.resolve(&registry).is_err(), "accepted {:?}", args);
        }
    }

    #[test]
    fn test_mixup_gate() {
        let config = parse(&["--mixup", "0.8"]);
        assert!(config.mixup_active());

        let config = parse(&["--mixup", "0.8", "--simclr_w", "1.0", "--contrastive_nomixup"]);
        assert!(config.mixup_enabled());
        assert!(!config.mixup_active());

        let config = parse(&["--mixup", "0.8", "--simclr_w", "1.0"]);
        assert!(config.mixup_active());

        let config = parse(&["--cutmix-minmax", "0.3", "0.7"]);
        assert!(config.mixup_active());
    }

    #[test]
    fn test_branches_and_lr_factor() {
        assert_eq!(parse(&[]).model_branches(), 1);
        assert_eq!(parse(&["--one_w", "1"]).model_branches(), 2);
        assert_eq!(parse(&["--dml_w", "1", "--num_branches", "3"]).model_branches(), 3);

        let config = parse(&["--sup_thresh", "5", "--lr_factor", "0.5"]);
        assert_eq!(config.lr_multiplier(4), 1.0);
        assert_eq!(config.lr_multiplier(5), 0.5);
        assert!(!config.unlabeled_terms_active(4));
        assert!(config.unlabeled_terms_active(5));

        let config = parse(&["--sup_thresh", "0"]);
        assert_eq!(config.lr_multiplier(10), 1.0);
    }

    #[test]
    fn test_seed_includes_rank() {
        let config = parse(&["--seed", "7", "--local-rank", "2"]);
        assert_eq!(config.process_seed(), 9);
    }

    #[test]
    fn test_auto_resume_skips_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_string_lossy().into_owned();
        let config = parse(&["--auto_resume", "--output_dir", &out]);
        assert_eq!(config.resume_source(), None);

        std::fs::write(dir.path().join("checkpoint.pth"), b"x").unwrap();
        assert!(config.resume_source().unwrap().ends_with("checkpoint.pth"));

        let config = parse(&["--auto_resume", "--output_dir", &out, "--resume", "other.pth"]);
        assert_eq!(config.resume_source().as_deref(), Some("other.pth"));
    }

    #[test]
    fn test_json_snapshot_roundtrip() {
        let mut config = parse(&["--dataset", "synthetic", "--mixup", "0.2"]);
        config.resolve(&DatasetRegistry::builtin()).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
