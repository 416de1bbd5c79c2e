//! Learning Rate Scheduler Module
//!
//! Epoch-stepped schedules. After epoch `e` finishes the scheduler is stepped
//! with `e` and the learning rate of the following epoch becomes `get_lr(e)`.

use serde::{Deserialize, Serialize};

use crate::config::{RunConfig, SchedulerKind};

/// Learning rate scheduler that adjusts the learning rate during training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LRScheduler {
    /// Constant learning rate (no scheduling)
    Constant { lr: f64, warmup: Warmup },

    /// Step decay: multiply by `decay_rate` every `decay_t` epochs
    StepDecay {
        initial_lr: f64,
        decay_t: usize,
        decay_rate: f64,
        warmup: Warmup,
    },

    /// Cosine annealing with restarts every `t_initial` epochs, `cycle_limit` cycles at most
    Cosine {
        initial_lr: f64,
        min_lr: f64,
        t_initial: usize,
        cycle_limit: usize,
        warmup: Warmup,
    },
}

/// Linear warmup from `lr_init` over the first `epochs` epochs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Warmup {
    pub epochs: usize,
    pub lr_init: f64,
}

impl Warmup {
    pub fn none() -> Self {
        Self {
            epochs: 0,
            lr_init: 0.0,
        }
    }

    fn lr(&self, epoch: usize, target: f64) -> Option<f64> {
        (epoch < self.epochs)
            .then(|| self.lr_init + epoch as f64 * (target - self.lr_init) / self.epochs as f64)
    }
}

impl LRScheduler {
    /// Create a constant learning rate scheduler
    pub fn constant(lr: f64) -> Self {
        Self::Constant {
            lr,
            warmup: Warmup::none(),
        }
    }

    /// Create a step decay scheduler
    pub fn step_decay(initial_lr: f64, decay_t: usize, decay_rate: f64) -> Self {
        Self::StepDecay {
            initial_lr,
            decay_t: decay_t.max(1),
            decay_rate,
            warmup: Warmup::none(),
        }
    }

    /// Create a cosine scheduler over `epochs` split into `cycles` restarts
    pub fn cosine(initial_lr: f64, min_lr: f64, epochs: usize, cycles: f64) -> Self {
        let cycles = cycles.max(f64::EPSILON);
        Self::Cosine {
            initial_lr,
            min_lr,
            t_initial: ((epochs as f64 / cycles).floor() as usize).max(1),
            cycle_limit: cycles.ceil().max(1.0) as usize,
            warmup: Warmup::none(),
        }
    }

    pub fn with_warmup(self, epochs: usize, lr_init: f64) -> Self {
        let warmup = Warmup { epochs, lr_init };
        match self {
            Self::Constant { lr, .. } => Self::Constant { lr, warmup },
            Self::StepDecay {
                initial_lr,
                decay_t,
                decay_rate,
                ..
            } => Self::StepDecay {
                initial_lr,
                decay_t,
                decay_rate,
                warmup,
            },
            Self::Cosine {
                initial_lr,
                min_lr,
                t_initial,
                cycle_limit,
                ..
            } => Self::Cosine {
                initial_lr,
                min_lr,
                t_initial,
                cycle_limit,
                warmup,
            },
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        let s = &config.schedule;
        let scheduler = match s.sched {
            SchedulerKind::Constant => Self::constant(s.lr),
            SchedulerKind::Step => Self::step_decay(s.lr, s.decay_t, s.decay_rate),
            SchedulerKind::Cosine => Self::cosine(s.lr, s.lr_min, config.run.epochs, s.lr_cycle),
        };
        scheduler.with_warmup(s.warmup_epochs, s.warmup_lr)
    }

    fn warmup(&self) -> &Warmup {
        match self {
            Self::Constant { warmup, .. } | Self::StepDecay { warmup, .. } | Self::Cosine { warmup, .. } => warmup,
        }
    }

    fn base_lr(&self) -> f64 {
        match self {
            Self::Constant { lr, .. } => *lr,
            Self::StepDecay { initial_lr, .. } | Self::Cosine { initial_lr, .. } => *initial_lr,
        }
    }

    /// Get the learning rate for a given epoch
    pub fn get_lr(&self, epoch: usize) -> f64 {
        if let Some(lr) = self.warmup().lr(epoch, self.base_lr()) {
            return lr;
        }
        match self {
            Self::Constant { lr, .. } => *lr,

            Self::StepDecay {
                initial_lr,
                decay_t,
                decay_rate,
                ..
            } => initial_lr * decay_rate.powi((epoch / decay_t) as i32),

            Self::Cosine {
                initial_lr,
                min_lr,
                t_initial,
                cycle_limit,
                ..
            } => {
                let cycle = epoch / t_initial;
                if cycle >= *cycle_limit {
                    return *min_lr;
                }
                let t_curr = (epoch - cycle * t_initial) as f64;
                let cosine_factor = (1.0 + (std::f64::consts::PI * t_curr / *t_initial as f64).cos()) / 2.0;
                min_lr + (initial_lr - min_lr) * cosine_factor
            }
        }
    }

    /// Get a description of the scheduler
    pub fn description(&self) -> String {
        let warmup = self.warmup();
        let base = match self {
            Self::Constant { lr, .. } => format!("Constant LR: {:.6}", lr),
            Self::StepDecay {
                initial_lr,
                decay_t,
                decay_rate,
                ..
            } => format!(
                "Step Decay: initial={:.6}, every {} epochs x{}",
                initial_lr, decay_t, decay_rate
            ),
            Self::Cosine {
                initial_lr,
                min_lr,
                t_initial,
                cycle_limit,
                ..
            } => format!(
                "Cosine: initial={:.6}, min={:.6}, period={}, cycles={}",
                initial_lr, min_lr, t_initial, cycle_limit
            ),
        };
        if warmup.epochs > 0 {
            format!("{} (warmup {} epochs from {:.2e})", base, warmup.epochs, warmup.lr_init)
        } else {
            base
        }
    }
}

/// Serializable scheduler state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub schedule: LRScheduler,
    pub last_epoch: Option<usize>,
    pub current_lr: f64,
}

/// A schedule plus the epoch it was last stepped with
#[derive(Debug, Clone)]
pub struct EpochScheduler {
    schedule: LRScheduler,
    last_epoch: Option<usize>,
    current_lr: f64,
}

impl EpochScheduler {
    pub fn new(schedule: LRScheduler) -> Self {
        let current_lr = schedule.get_lr(0);
        Self {
            schedule,
            last_epoch: None,
            current_lr,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }

    pub fn schedule(&self) -> &LRScheduler {
        &self.schedule
    }

    /// Called once after `epoch` finished
    pub fn step(&mut self, epoch: usize) {
        self.last_epoch = Some(epoch);
        self.current_lr = self.schedule.get_lr(epoch);
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            schedule: self.schedule.clone(),
            last_epoch: self.last_epoch,
            current_lr: self.current_lr,
        }
    }

    pub fn load_state(&mut self, state: SchedulerState) {
        self.schedule = state.schedule;
        self.last_epoch = state.last_epoch;
        self.current_lr = state.current_lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LRScheduler::constant(0.001);
        assert_eq!(scheduler.get_lr(0), 0.001);
        assert_eq!(scheduler.get_lr(100), 0.001);
    }

    #[test]
    fn test_step_decay_scheduler() {
        let scheduler = LRScheduler::step_decay(0.1, 10, 0.1);
        assert_eq!(scheduler.get_lr(9), 0.1);
        assert!((scheduler.get_lr(10) - 0.01).abs() < 1e-10);
        assert!((scheduler.get_lr(25) - 0.001).abs() < 1e-10);
    }

    #[test]
    fn test_cosine_scheduler() {
        let scheduler = LRScheduler::cosine(0.1, 0.001, 100, 1.0);
        assert!((scheduler.get_lr(0) - 0.1).abs() < 1e-12);
        let expected_mid = (0.1 + 0.001) / 2.0;
        assert!((scheduler.get_lr(50) - expected_mid).abs() < 1e-9);
        assert_eq!(scheduler.get_lr(100), 0.001);
    }

    #[test]
    fn test_cosine_cycles_restart() {
        let scheduler = LRScheduler::cosine(0.1, 0.0, 100, 2.0);
        assert!((scheduler.get_lr(50) - 0.1).abs() < 1e-12);
        assert!(scheduler.get_lr(49) < 0.001);
        assert_eq!(scheduler.get_lr(100), 0.0);
    }

    #[test]
    fn test_warmup_ramps_to_base() {
        let scheduler = LRScheduler::cosine(0.1, 0.0, 50, 1.0).with_warmup(5, 0.0);
        assert_eq!(scheduler.get_lr(0), 0.0);
        assert!((scheduler.get_lr(4) - 0.08).abs() < 1e-12);
        assert!(scheduler.get_lr(5) <= 0.1);
    }

    #[test]
    fn test_epoch_scheduler_state_roundtrip() {
        let mut scheduler = EpochScheduler::new(LRScheduler::step_decay(1.0, 1, 0.5));
        assert_eq!(scheduler.current_lr(), 1.0);
        scheduler.step(0);
        scheduler.step(1);
        assert_eq!(scheduler.current_lr(), 0.5);

        let json = serde_json::to_string(&scheduler.state()).unwrap();
        let mut restored = EpochScheduler::new(LRScheduler::constant(9.0));
        restored.load_state(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.state(), scheduler.state());
        restored.step(2);
        assert_eq!(restored.current_lr(), 0.25);
    }

    #[test]
    fn test_from_config_uses_sched_flag() {
        let config = RunConfig::try_from_args(["ssl_sifar", "--sched", "step", "--decay-t", "2"]).unwrap();
        let scheduler = LRScheduler::from_config(&config);
        assert!(matches!(scheduler, LRScheduler::StepDecay { decay_t: 2, .. }));
    }
}
