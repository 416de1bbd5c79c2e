//! Mixup / Cutmix for labeled batches
//!
//! One mixing draw per batch. Every sample is paired with the sample at the
//! mirrored batch position. Mixup blends whole clips; cutmix pastes the same
//! spatial box into every frame. Targets are mixed with the ratio of pixels
//! that actually come from each sample.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};

use crate::config::RunConfig;
use crate::training::criterion::{smoothed_one_hot, Targets};

/// Kind of mixing applied to a batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MixKind {
    Mixup,
    /// `(top, bottom, left, right)` in pixels, half-open
    Cutmix { y0: usize, y1: usize, x0: usize, x1: usize },
}

/// Parameters of one mixing draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixParams {
    pub kind: MixKind,
    /// Weight of the original sample
    pub lambda: f64,
}

#[derive(Debug, Clone)]
pub struct Mixup {
    mixup_alpha: f64,
    cutmix_alpha: f64,
    cutmix_minmax: Option<(f64, f64)>,
    prob: f64,
    switch_prob: f64,
    smoothing: f64,
    num_classes: usize,
    rng: ChaCha8Rng,
}

impl Mixup {
    /// `None` when mixing is not active for this run
    pub fn from_config(config: &RunConfig, seed: u64) -> Option<Self> {
        if !config.mixup_active() {
            return None;
        }
        let a = &config.augment;
        Some(Self {
            mixup_alpha: a.mixup,
            cutmix_alpha: a.cutmix,
            cutmix_minmax: a.cutmix_minmax.as_ref().and_then(|v| match v.as_slice() {
                [lo, hi] => Some((*lo, *hi)),
                _ => None,
            }),
            prob: a.mixup_prob,
            switch_prob: a.mixup_switch_prob,
            smoothing: a.smoothing,
            num_classes: config.model.num_classes,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    fn beta(&mut self, alpha: f64) -> f64 {
        match Beta::new(alpha, alpha) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 1.0,
        }
    }

    /// Draw the parameters for a batch of `height x width` frames
    pub fn sample(&mut self, height: usize, width: usize) -> Option<MixParams> {
        if self.rng.gen::<f64>() >= self.prob {
            return None;
        }
        let cutmix_enabled = self.cutmix_alpha > 0.0 || self.cutmix_minmax.is_some();
        let use_cutmix = match (self.mixup_alpha > 0.0, cutmix_enabled) {
            (true, true) => self.rng.gen::<f64>() < self.switch_prob,
            (false, true) => true,
            (true, false) => false,
            (false, false) => return None,
        };

        if !use_cutmix {
            let lambda = self.beta(self.mixup_alpha);
            return Some(MixParams {
                kind: MixKind::Mixup,
                lambda,
            });
        }

        let (cut_h, cut_w) = match self.cutmix_minmax {
            Some((lo, hi)) => (
                self.rng.gen_range((lo * height as f64) as usize..=(hi * height as f64) as usize),
                self.rng.gen_range((lo * width as f64) as usize..=(hi * width as f64) as usize),
            ),
            None => {
                let ratio = (1.0 - self.beta(self.cutmix_alpha)).sqrt();
                ((height as f64 * ratio) as usize, (width as f64 * ratio) as usize)
            }
        };
        let (y0, y1) = self.centered_span(cut_h, height);
        let (x0, x1) = self.centered_span(cut_w, width);
        let area = ((y1 - y0) * (x1 - x0)) as f64;
        Some(MixParams {
            kind: MixKind::Cutmix { y0, y1, x0, x1 },
            lambda: 1.0 - area / (height * width) as f64,
        })
    }

    /// Span of length `cut` around a random center, clipped to `[0, size)`
    fn centered_span(&mut self, cut: usize, size: usize) -> (usize, usize) {
        let center = self.rng.gen_range(0..size.max(1)) as i64;
        let half = (cut / 2) as i64;
        let lo = (center - half).clamp(0, size as i64) as usize;
        let hi = (center + half).clamp(0, size as i64) as usize;
        (lo, hi)
    }

    /// Mixed targets: `lambda * y + (1 - lambda) * y_mirrored` of smoothed one-hot rows
    pub fn mixed_targets(&self, labels: &[usize], lambda: f64) -> Vec<f32> {
        let k = self.num_classes;
        let rows = smoothed_one_hot(labels, k, self.smoothing);
        let n = labels.len();
        let mut out = vec![0.0f32; n * k];
        for i in 0..n {
            let j = n - 1 - i;
            for c in 0..k {
                out[i * k + c] = (lambda * rows[i * k + c] as f64 + (1.0 - lambda) * rows[j * k + c] as f64) as f32;
            }
        }
        out
    }

    /// Mix a `[N, C, T, H, W]` batch; unmixed batches keep hard targets
    pub fn apply<B: Backend>(&mut self, x: Tensor<B, 5>, labels: &[usize]) -> (Tensor<B, 5>, Targets<B>) {
        let [n, c, t, h, w] = x.dims();
        let Some(params) = self.sample(h, w) else {
            return (x, Targets::Hard(labels.to_vec()));
        };
        let device = x.device();

        let mirror: Vec<i64> = (0..n as i64).rev().collect();
        let mirror = Tensor::<B, 1, Int>::from_data(TensorData::new(mirror, [n]), &device);
        let mirrored = x.clone().select(0, mirror);

        let mixed = match params.kind {
            MixKind::Mixup => x * params.lambda + mirrored * (1.0 - params.lambda),
            MixKind::Cutmix { y0, y1, x0, x1 } => {
                if y1 > y0 && x1 > x0 {
                    let region = [0..n, 0..c, 0..t, y0..y1, x0..x1];
                    let patch = mirrored.slice(region.clone());
                    x.slice_assign(region, patch)
                } else {
                    x
                }
            }
        };

        let targets = TensorData::new(self.mixed_targets(labels, params.lambda), [n, self.num_classes]);
        (mixed, Targets::Soft(Tensor::from_data(targets, &device)))
    }
}
