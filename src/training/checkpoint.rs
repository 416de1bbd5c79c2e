//! Checkpoint container and resume state machine
//!
//! A checkpoint is one bincode-encoded [`CheckpointFile`]. Burn records
//! (model, optimizer, EMA) are embedded as byte blobs so that the container
//! itself stays backend independent. Files are written through a temp file
//! in the destination directory and renamed into place.

use std::io::Write;
use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::model::VideoClassifier;
use crate::training::scaler::ScalerState;
use crate::training::scheduler::{EpochScheduler, SchedulerState};
use crate::training::trainer::Learner;
use crate::utils::error::{Result, SslError};

pub const LATEST_CHECKPOINT: &str = "checkpoint.pth";
pub const BEST_CHECKPOINT: &str = "model_best.pth";

type ByteRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Optimizer record plus the number of steps it has taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub steps: usize,
    pub record: Vec<u8>,
}

/// Everything persisted at an epoch boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub model: Vec<u8>,
    pub optimizer: Option<OptimizerState>,
    pub lr_scheduler: Option<SchedulerState>,
    pub epoch: Option<usize>,
    pub args: Option<RunConfig>,
    pub scaler: Option<ScalerState>,
    pub max_accuracy: Option<f64>,
    pub model_ema: Option<Vec<u8>>,
    pub saved_at: String,
}

pub fn encode_record<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>> {
    Recorder::<B>::record(&ByteRecorder::default(), record, ())
        .map_err(|e| SslError::Model(format!("Failed to encode record: {:?}", e)))
}

/// Decode a record blob read from `source`
pub fn decode_record<B: Backend, R: Record<B>>(bytes: &[u8], device: &B::Device, source: &str) -> Result<R> {
    Recorder::<B>::load(&ByteRecorder::default(), bytes.to_vec(), device)
        .map_err(|e| SslError::checkpoint(source, format!("{:?}", e)))
}

pub fn encode_module<B: Backend, M: Module<B>>(module: M) -> Result<Vec<u8>> {
    encode_record::<B, _>(module.into_record())
}

/// Load the weights in `bytes` into `module`
pub fn decode_module<B: Backend, M: Module<B>>(
    module: M,
    bytes: &[u8],
    device: &B::Device,
    source: &str,
) -> Result<M> {
    let record = decode_record::<B, M::Record>(bytes, device, source)?;
    Ok(module.load_record(record))
}

impl CheckpointFile {
    /// A container holding model weights only
    pub fn weights_only(model: Vec<u8>) -> Self {
        Self {
            model,
            optimizer: None,
            lr_scheduler: None,
            epoch: None,
            args: None,
            scaler: None,
            max_accuracy: None,
            model_ema: None,
            saved_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Snapshot the training state after `epoch`
    pub fn capture<B, O>(
        learner: &Learner<B, O>,
        scheduler: &EpochScheduler,
        epoch: usize,
        max_accuracy: f64,
        config: &RunConfig,
    ) -> Result<Self>
    where
        B: AutodiffBackend,
        O: Optimizer<VideoClassifier<B>, B>,
    {
        let model_ema = match &learner.ema {
            Some(ema) => Some(encode_module::<B::InnerBackend, _>(ema.module().clone())?),
            None => None,
        };
        Ok(Self {
            model: encode_module::<B, _>(learner.model.clone())?,
            optimizer: Some(OptimizerState {
                steps: learner.optimizer_steps,
                record: encode_record::<B, _>(learner.optimizer.to_record())?,
            }),
            lr_scheduler: Some(scheduler.state()),
            epoch: Some(epoch),
            args: Some(config.clone()),
            scaler: Some(learner.scaler.state()),
            max_accuracy: Some(max_accuracy),
            model_ema,
            saved_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Optimizer, schedule and epoch are all present
    pub fn has_training_state(&self) -> bool {
        self.optimizer.is_some() && self.lr_scheduler.is_some() && self.epoch.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SslError::Model(format!("Failed to encode checkpoint: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8], source: &str) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SslError::checkpoint(source, e))
    }

    /// Write to `path`, replacing any previous file in one rename
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let bytes = self.to_bytes()?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| SslError::Io(e.error))?;
        Ok(())
    }

    /// Read from a local path or an http(s) URL
    pub fn read(source: &str) -> Result<Self> {
        let bytes = if source.starts_with("http://") || source.starts_with("https://") {
            info!("Downloading checkpoint from {}", source);
            fetch(source)?
        } else {
            std::fs::read(source).map_err(|e| SslError::checkpoint(source, e))?
        };
        Self::from_bytes(&bytes, source)
    }
}

fn fetch(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| SslError::checkpoint(url, e))?;
    let bytes = response.bytes().map_err(|e| SslError::checkpoint(url, e))?;
    Ok(bytes.to_vec())
}

/// Tracks the best test accuracy of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestTracker {
    max_accuracy: f64,
}

impl BestTracker {
    pub fn new(max_accuracy: f64) -> Self {
        Self { max_accuracy }
    }

    pub fn max_accuracy(&self) -> f64 {
        self.max_accuracy
    }

    /// Fold `accuracy` into the running max; true when it is the new best (ties count)
    pub fn observe(&mut self, accuracy: f64) -> bool {
        self.max_accuracy = self.max_accuracy.max(accuracy);
        accuracy == self.max_accuracy
    }
}

/// Write the latest checkpoint and, when `is_best`, the best one
pub fn persist(checkpoint: &CheckpointFile, output_dir: &Path, is_best: bool) -> Result<()> {
    checkpoint.write_atomic(&output_dir.join(LATEST_CHECKPOINT))?;
    if is_best {
        checkpoint.write_atomic(&output_dir.join(BEST_CHECKPOINT))?;
    }
    Ok(())
}

/// What a resume restored beyond the model weights
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Restored {
    /// First epoch to train
    pub start_epoch: Option<usize>,
    pub max_accuracy: Option<f64>,
}

/// Apply `checkpoint` to a freshly built learner
///
/// Model weights always load. The rest of the training state loads only
/// outside evaluation-only runs and only when the checkpoint carries the
/// optimizer, the schedule and the epoch.
pub fn restore<B, O>(
    checkpoint: &CheckpointFile,
    source: &str,
    learner: Learner<B, O>,
    scheduler: &mut EpochScheduler,
    config: &RunConfig,
    device: &B::Device,
) -> Result<(Learner<B, O>, Restored)>
where
    B: AutodiffBackend,
    O: Optimizer<VideoClassifier<B>, B>,
{
    let Learner {
        model,
        mut optimizer,
        mut ema,
        mut scaler,
        mut optimizer_steps,
    } = learner;

    let model = decode_module::<B, _>(model, &checkpoint.model, device, source)?;
    info!("Loaded model weights from {}", source);
    let mut restored = Restored::default();

    if let (false, Some(opt), Some(sched), Some(epoch)) = (
        config.eval_only(),
        &checkpoint.optimizer,
        &checkpoint.lr_scheduler,
        checkpoint.epoch,
    ) {
        let record = decode_record::<B, O::Record>(&opt.record, device, source)?;
        optimizer = optimizer.load_record(record);
        optimizer_steps = opt.steps;
        scheduler.load_state(sched.clone());
        restored.start_epoch = Some(epoch + 1);

        match checkpoint.scaler {
            Some(state) if !config.run.no_resume_loss_scaler => {
                info!("Resume with previous loss scaler state");
                scaler.load_state(state);
            }
            _ => {}
        }

        if let Some(shadow) = ema.as_mut() {
            match &checkpoint.model_ema {
                Some(bytes) => {
                    let module = decode_module::<B::InnerBackend, _>(shadow.module().clone(), bytes, device, source)?;
                    shadow.replace(module);
                }
                None => {
                    warn!("Checkpoint has no EMA weights, EMA restarts from the model weights");
                    shadow.replace(model.valid());
                }
            }
        }
        restored.max_accuracy = checkpoint.max_accuracy;
    }

    Ok((
        Learner {
            model,
            optimizer,
            ema,
            scaler,
            optimizer_steps,
        },
        restored,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;

    use crate::model::VideoClassifierConfig;
    use crate::training::ema::ShadowModel;
    use crate::training::scaler::LossScaler;
    use crate::training::scheduler::LRScheduler;
    use crate::training::to_host;

    type TestBackend = Autodiff<NdArray>;

    fn learner(seed: u64) -> Learner<TestBackend, impl Optimizer<VideoClassifier<TestBackend>, TestBackend>> {
        use burn::tensor::backend::Backend as _;
        TestBackend::seed(seed);
        let device = Default::default();
        let model = VideoClassifierConfig::new(3)
            .with_super_img_rows(2)
            .with_embedding_dim(8)
            .init::<TestBackend>(&device);
        let ema = ShadowModel::new(model.valid(), 0.9);
        Learner {
            model,
            optimizer: AdamConfig::new().init::<TestBackend, VideoClassifier<TestBackend>>(),
            ema: Some(ema),
            scaler: LossScaler::new(true),
            optimizer_steps: 0,
        }
    }

    fn head(model: &VideoClassifier<TestBackend>) -> Vec<f32> {
        to_host(model.heads[0].weight.val(), "head").unwrap()
    }

    fn config(args: &[&str]) -> RunConfig {
        let mut full = vec!["ssl_sifar"];
        full.extend_from_slice(args);
        RunConfig::try_from_args(full).unwrap()
    }

    fn saved(dir: &Path) -> (Learner<TestBackend, impl Optimizer<VideoClassifier<TestBackend>, TestBackend>>, PathBuf) {
        let mut source = learner(1);
        source.optimizer_steps = 7;
        source.scaler.update(true);
        let mut scheduler = EpochScheduler::new(LRScheduler::step_decay(1.0, 1, 0.5));
        scheduler.step(4);
        let checkpoint = CheckpointFile::capture(&source, &scheduler, 4, 55.0, &config(&[])).unwrap();
        persist(&checkpoint, dir, true).unwrap();
        (source, dir.join(LATEST_CHECKPOINT))
    }

    #[test]
    fn test_best_written_on_ties_and_improvements() {
        let mut tracker = BestTracker::new(0.0);
        let written: Vec<bool> = [10.0, 30.0, 20.0, 30.0].iter().map(|&a| tracker.observe(a)).collect();
        assert_eq!(written, vec![true, true, false, true]);
        assert_eq!(tracker.max_accuracy(), 30.0);
    }

    #[test]
    fn test_full_resume_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (source, path) = saved(dir.path());
        assert!(dir.path().join(BEST_CHECKPOINT).exists());

        let checkpoint = CheckpointFile::read(path.to_str().unwrap()).unwrap();
        assert!(checkpoint.has_training_state());
        let mut scheduler = EpochScheduler::new(LRScheduler::constant(9.0));
        let (resumed, restored) = restore(
            &checkpoint,
            "test",
            learner(2),
            &mut scheduler,
            &config(&[]),
            &Default::default(),
        )
        .unwrap();

        assert_eq!(restored.start_epoch, Some(5));
        assert_eq!(restored.max_accuracy, Some(55.0));
        assert_eq!(resumed.optimizer_steps, 7);
        assert_eq!(resumed.scaler.state(), source.scaler.state());
        assert_eq!(scheduler.current_lr(), 1.0 / 16.0);
        assert_eq!(head(&resumed.model), head(&source.model));
    }

    #[test]
    fn test_eval_only_loads_weights_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (source, path) = saved(dir.path());
        let checkpoint = CheckpointFile::read(path.to_str().unwrap()).unwrap();
        let mut scheduler = EpochScheduler::new(LRScheduler::constant(9.0));
        let (resumed, restored) = restore(
            &checkpoint,
            "test",
            learner(2),
            &mut scheduler,
            &config(&["--eval"]),
            &Default::default(),
        )
        .unwrap();

        assert_eq!(restored, Restored::default());
        assert_eq!(resumed.optimizer_steps, 0);
        assert_eq!(scheduler.current_lr(), 9.0);
        assert_eq!(head(&resumed.model), head(&source.model));
    }

    #[test]
    fn test_partial_checkpoint_restores_model_only() {
        let source = learner(1);
        let checkpoint = CheckpointFile::weights_only(encode_module::<TestBackend, _>(source.model.clone()).unwrap());
        let mut scheduler = EpochScheduler::new(LRScheduler::constant(9.0));
        let (resumed, restored) =
            restore(&checkpoint, "test", learner(2), &mut scheduler, &config(&[]), &Default::default()).unwrap();
        assert_eq!(restored.start_epoch, None);
        assert_eq!(head(&resumed.model), head(&source.model));
    }

    #[test]
    fn test_scaler_skipped_and_missing_ema_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (source, path) = saved(dir.path());
        let mut checkpoint = CheckpointFile::read(path.to_str().unwrap()).unwrap();
        checkpoint.model_ema = None;

        let mut scheduler = EpochScheduler::new(LRScheduler::constant(9.0));
        let (resumed, _) = restore(
            &checkpoint,
            "test",
            learner(2),
            &mut scheduler,
            &config(&["--no-resume-loss-scaler"]),
            &Default::default(),
        )
        .unwrap();

        assert_eq!(resumed.scaler.scale(), crate::training::scaler::INITIAL_SCALE);
        let ema_head = to_host(resumed.ema.unwrap().module().heads[0].weight.val(), "ema").unwrap();
        assert_eq!(ema_head, head(&source.model));
    }

    #[test]
    fn test_corrupt_checkpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LATEST_CHECKPOINT);
        std::fs::write(&path, b"not a checkpoint").unwrap();
        let err = CheckpointFile::read(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, SslError::Checkpoint { .. }));

        let err = CheckpointFile::read(dir.path().join("missing.pth").to_str().unwrap()).unwrap_err();
        assert!(matches!(err, SslError::Checkpoint { .. }));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        saved(dir.path());
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
    }
}
