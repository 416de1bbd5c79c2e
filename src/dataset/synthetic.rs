//! Synthetic clip source
//!
//! Class-dependent spatio-temporal patterns plus per-draw noise. Used by the
//! `synthetic` dataset for smoke runs without any frames on disk.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::loader::{ClipSample, ClipSource};
use crate::utils::error::Result;

pub struct SyntheticClips {
    num_samples: usize,
    num_classes: usize,
    clip_dims: [usize; 4],
    views: usize,
    offset: usize,
    noise: f32,
}

impl SyntheticClips {
    /// `offset` shifts sample ids so that different splits hold different clips
    pub fn new(num_samples: usize, num_classes: usize, clip_dims: [usize; 4], views: usize, offset: usize) -> Self {
        Self {
            num_samples,
            num_classes: num_classes.max(1),
            clip_dims,
            views: views.max(1),
            offset,
            noise: 0.3,
        }
    }

    fn pattern(&self, class: usize, shift: usize) -> Vec<f32> {
        let [c, t, h, w] = self.clip_dims;
        let freq = 0.35 * (class + 1) as f32;
        let mut out = Vec::with_capacity(c * t * h * w);
        for ci in 0..c {
            for ti in 0..t {
                let tt = ((ti + shift) % t.max(1)) as f32;
                for hi in 0..h {
                    for wi in 0..w {
                        let phase = freq * (hi + wi) as f32 + 0.5 * ci as f32 + 0.2 * tt;
                        out.push(phase.sin());
                    }
                }
            }
        }
        out
    }
}

impl ClipSource for SyntheticClips {
    fn len(&self) -> usize {
        self.num_samples
    }

    fn label(&self, index: usize) -> usize {
        (index + self.offset) % self.num_classes
    }

    fn views(&self) -> usize {
        self.views
    }

    fn clip_dims(&self) -> [usize; 4] {
        self.clip_dims
    }

    fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<ClipSample> {
        let label = self.label(index);
        let views = (0..self.views)
            .map(|v| {
                let mut clip = self.pattern(label, v);
                for value in clip.iter_mut() {
                    *value += rng.gen_range(-self.noise..self.noise);
                }
                clip
            })
            .collect();
        Ok(ClipSample { views, label })
    }
}
