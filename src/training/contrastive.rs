//! Unlabeled consistency terms
//!
//! Every term compares the two temporal views of an unlabeled clip. View A is
//! the regularly sampled clip, view B the one sampled at twice the stride.
//! Terms that treat one side as a target detach it.

use burn::tensor::{activation, backend::Backend, Tensor, TensorData};

use crate::training::criterion::mean_of;
use crate::training::to_host;
use crate::utils::error::Result;
use crate::utils::metrics::argmax;

const NORM_EPS: f64 = 1e-8;
const MASKED: f32 = -1e9;

/// Row-wise L2 normalisation
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm
}

/// Mean row-wise cosine similarity
pub fn mean_cosine<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 1> {
    (l2_normalize(a) * l2_normalize(b)).sum_dim(1).mean()
}

fn identity(n: usize) -> Vec<f32> {
    let mut out = vec![0.0; n * n];
    for i in 0..n {
        out[i * n + i] = 1.0;
    }
    out
}

/// NT-Xent over the `2M` rows of `cat[a, b]`; row `i` is positive with row `i + M`
pub fn nt_xent<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>, temperature: f64) -> Tensor<B, 1> {
    let [m, _] = a.dims();
    let n = 2 * m;
    let device = a.device();
    let z = l2_normalize(Tensor::cat(vec![a, b], 0));
    let sim = z.clone().matmul(z.transpose()) / temperature;

    let self_mask = Tensor::<B, 2>::from_data(TensorData::new(identity(n), [n, n]), &device);
    let sim = sim + self_mask * MASKED;

    let mut positives = vec![0.0f32; n * n];
    for i in 0..n {
        positives[i * n + (i + m) % n] = 1.0;
    }
    let positives = Tensor::<B, 2>::from_data(TensorData::new(positives, [n, n]), &device);

    (activation::log_softmax(sim, 1) * positives).sum_dim(1).mean().neg()
}

/// InfoNCE of view-A queries against detached view-B keys
pub fn info_nce<B: Backend>(queries: Tensor<B, 2>, keys: Tensor<B, 2>, temperature: f64) -> Tensor<B, 1> {
    let [m, _] = queries.dims();
    let device = queries.device();
    let logits = l2_normalize(queries).matmul(l2_normalize(keys.detach()).transpose()) / temperature;
    let targets = Tensor::<B, 2>::from_data(TensorData::new(identity(m), [m, m]), &device);
    (activation::log_softmax(logits, 1) * targets).sum_dim(1).mean().neg()
}

/// Group contrastive term
///
/// Samples are grouped by the argmax of their view-A prediction. The mean
/// class distribution of every group in view A is contrasted with the same
/// group's mean in view B.
pub fn group_contrastive<B: Backend>(
    logits_a: Tensor<B, 2>,
    logits_b: Tensor<B, 2>,
    temperature: f64,
) -> Result<Tensor<B, 1>> {
    let [m, k] = logits_a.dims();
    let device = logits_a.device();
    let host = to_host(logits_a.clone().detach(), "view-A logits")?;

    let mut groups: Vec<usize> = host.chunks(k).map(argmax).collect();
    let mut present = groups.clone();
    present.sort_unstable();
    present.dedup();
    for g in groups.iter_mut() {
        *g = present.binary_search(g).unwrap_or(0);
    }

    let num_groups = present.len();
    let mut membership = vec![0.0f32; num_groups * m];
    for (sample, &group) in groups.iter().enumerate() {
        membership[group * m + sample] = 1.0;
    }
    for row in membership.chunks_mut(m) {
        let size: f32 = row.iter().sum();
        row.iter_mut().for_each(|v| *v /= size.max(1.0));
    }
    let membership = Tensor::<B, 2>::from_data(TensorData::new(membership, [num_groups, m]), &device);

    let group_a = membership.clone().matmul(activation::softmax(logits_a, 1));
    let group_b = membership.matmul(activation::softmax(logits_b, 1));
    Ok(nt_xent(group_a, group_b, temperature))
}

/// Parameters of the instance + group contrastive term
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimclrTerm {
    pub temperature: f64,
    pub gamma: f64,
    pub beta: f64,
    pub group_loss: bool,
}

impl SimclrTerm {
    pub fn forward<B: Backend>(
        &self,
        embedding_a: Tensor<B, 2>,
        embedding_b: Tensor<B, 2>,
        logits_a: Tensor<B, 2>,
        logits_b: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>> {
        let instance = nt_xent(embedding_a, embedding_b, self.temperature) * self.gamma;
        if !self.group_loss {
            return Ok(instance);
        }
        let group = group_contrastive(logits_a, logits_b, self.temperature)?;
        Ok(instance + group * self.beta)
    }
}

/// Mean pairwise cosine similarity between branch predictions; lower is more diverse
pub fn branch_divergence<B: Backend>(branches: &[Tensor<B, 2>]) -> Tensor<B, 1> {
    let probs: Vec<Tensor<B, 2>> = branches
        .iter()
        .map(|b| activation::softmax(b.clone(), 1))
        .collect();
    let mut pairs = Vec::new();
    for i in 0..probs.len() {
        for j in i + 1..probs.len() {
            pairs.push(mean_cosine(probs[i].clone(), probs[j].clone()));
        }
    }
    mean_of(pairs)
}

/// Symmetric negative cosine against the detached other view
pub fn simsiam<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 1> {
    let ab = mean_cosine(a.clone(), b.clone().detach());
    let ba = mean_cosine(b, a.detach());
    (ab + ba).neg() / 2.0
}

/// Symmetric `2 - 2 cos` against the detached other view
pub fn byol<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 1> {
    let ab = mean_cosine(a.clone(), b.clone().detach());
    let ba = mean_cosine(b, a.detach());
    ((ab + ba) / 2.0).mul_scalar(-2.0).add_scalar(2.0)
}
