//! Batched clip loading
//!
//! A [`ClipLoader`] turns a [`ClipSource`] into an ordered stream of host-side
//! batches. Samples of a batch are decoded in parallel on a bounded rayon pool,
//! but every sample draws its randomness from its own generator seeded by
//! `(seed, epoch, pass, index)`, so the delivered batches only depend on the
//! seed and the epoch, never on thread scheduling.

use std::sync::Arc;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::utils::error::{Result, SslError};

/// Decoded views of one sample, each a `[C, T, H, W]` buffer
#[derive(Debug, Clone)]
pub struct ClipSample {
    pub views: Vec<Vec<f32>>,
    pub label: usize,
}

/// Random-access source of clips
pub trait ClipSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn label(&self, index: usize) -> usize;

    /// Views produced per sample
    fn views(&self) -> usize;

    /// `[C, T, H, W]` of every view
    fn clip_dims(&self) -> [usize; 4];

    /// Called on the loader workers, which have no run subscriber: report
    /// problems through the error, not through `tracing`
    fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<ClipSample>;
}

/// A batch on the host; `views[v]` is a `[N, C, T, H, W]` buffer
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub views: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
    pub indices: Vec<usize>,
    pub clip_dims: [usize; 4],
}

impl HostBatch {
    fn collate(samples: Vec<ClipSample>, indices: Vec<usize>, clip_dims: [usize; 4], views: usize) -> Result<Self> {
        let clip_len: usize = clip_dims.iter().product();
        let mut buffers = vec![Vec::with_capacity(clip_len * samples.len()); views];
        let mut labels = Vec::with_capacity(samples.len());

        for sample in samples {
            if sample.views.len() != views {
                return Err(SslError::Dataset(format!(
                    "Expected {} views per sample, got {}",
                    views,
                    sample.views.len()
                )));
            }
            for (buffer, view) in buffers.iter_mut().zip(sample.views) {
                if view.len() != clip_len {
                    return Err(SslError::Dataset(format!(
                        "Clip of {} values does not match dims {:?}",
                        view.len(),
                        clip_dims
                    )));
                }
                buffer.extend_from_slice(&view);
            }
            labels.push(sample.label);
        }

        Ok(Self {
            views: buffers,
            labels,
            indices,
            clip_dims,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_views(&self) -> usize {
        self.views.len()
    }

    /// Upload one view as a `[N, C, T, H, W]` tensor
    pub fn view_tensor<B: Backend>(&self, view: usize, device: &B::Device) -> Tensor<B, 5> {
        let [c, t, h, w] = self.clip_dims;
        let data = TensorData::new(self.views[view].clone(), [self.len(), c, t, h, w]);
        Tensor::from_data(data, device)
    }
}

/// Seed of one sample draw
fn sample_seed(seed: u64, epoch: u64, pass: u64, index: usize) -> u64 {
    let mut z = seed
        .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(pass.wrapping_mul(0xD1B5_4A32_D192_ED03))
        .wrapping_add(index as u64);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Ordered, optionally shuffled batches over a clip source
pub struct ClipLoader {
    source: Arc<dyn ClipSource>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    pool: rayon::ThreadPool,
}

impl ClipLoader {
    pub fn new(
        source: Arc<dyn ClipSource>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
        num_workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(SslError::Config("Batch size must be positive".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("clip-loader-{}", i))
            .build()
            .map_err(|e| SslError::Dataset(format!("Cannot start loader workers: {}", e)))?;
        Ok(Self {
            source,
            batch_size,
            shuffle,
            drop_last,
            seed,
            pool,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.source.len()
    }

    pub fn num_batches(&self) -> usize {
        let n = self.source.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn source(&self) -> &Arc<dyn ClipSource> {
        &self.source
    }

    /// Sample order of one pass
    pub fn order(&self, epoch: u64, pass: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.source.len()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(sample_seed(self.seed, epoch, pass, usize::MAX));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Batches of one epoch
    pub fn iter(&self, epoch: u64) -> BatchIter<'_> {
        self.iter_pass(epoch, 0)
    }

    fn iter_pass(&self, epoch: u64, pass: u64) -> BatchIter<'_> {
        BatchIter {
            loader: self,
            order: self.order(epoch, pass),
            epoch,
            pass,
            batch: 0,
        }
    }

    /// Endless batches that restart the source whenever it runs out
    pub fn cycle<'a>(&'a self, epoch: u64) -> Cycled<BatchIter<'a>, impl FnMut(u64) -> BatchIter<'a>> {
        Cycled::new(move |pass| self.iter_pass(epoch, pass))
    }

    fn load_batch(&self, indices: Vec<usize>, epoch: u64, pass: u64) -> Result<HostBatch> {
        let source = &self.source;
        let samples: Result<Vec<ClipSample>> = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&index| {
                    let mut rng = ChaCha8Rng::seed_from_u64(sample_seed(self.seed, epoch, pass, index));
                    source.load(index, &mut rng)
                })
                .collect()
        });
        HostBatch::collate(samples?, indices, source.clip_dims(), source.views())
    }
}

/// One pass over a loader
pub struct BatchIter<'a> {
    loader: &'a ClipLoader,
    order: Vec<usize>,
    epoch: u64,
    pass: u64,
    batch: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch >= self.loader.num_batches() {
            return None;
        }
        let start = self.batch * self.loader.batch_size;
        let end = (start + self.loader.batch_size).min(self.order.len());
        self.batch += 1;
        let indices = self.order[start..end].to_vec();
        Some(self.loader.load_batch(indices, self.epoch, self.pass))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.loader.num_batches().saturating_sub(self.batch);
        (left, Some(left))
    }
}

/// Restarts an iterator from a factory whenever it is exhausted
///
/// Stops for good when a fresh pass yields nothing at all; that pass is not
/// recorded as a restart.
pub struct Cycled<I, F> {
    make: F,
    current: I,
    pass: u64,
    yielded: usize,
    restarts: Vec<usize>,
    exhausted: bool,
}

impl<I: Iterator, F: FnMut(u64) -> I> Cycled<I, F> {
    pub fn new(mut make: F) -> Self {
        let current = make(0);
        Self {
            make,
            current,
            pass: 0,
            yielded: 0,
            restarts: Vec::new(),
            exhausted: false,
        }
    }

    /// Positions (in items yielded) at which the source was restarted
    pub fn restarts(&self) -> &[usize] {
        &self.restarts
    }
}

impl<I: Iterator, F: FnMut(u64) -> I> Iterator for Cycled<I, F> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if let Some(item) = self.current.next() {
            self.yielded += 1;
            return Some(item);
        }
        self.pass += 1;
        self.current = (self.make)(self.pass);
        match self.current.next() {
            Some(item) => {
                self.restarts.push(self.yielded);
                self.yielded += 1;
                Some(item)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}
