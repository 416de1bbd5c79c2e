//! Supervised criteria
//!
//! The primary criterion and the distillation-style term are picked once per
//! run from the configuration, each by a fixed priority:
//!
//! - primary: mixing active > label smoothing > plain cross-entropy
//! - distillation: `dml_w` > `one_w` > `mulmix_b` > `selfdis_w`
//!
//! All criteria reduce to a soft-target cross-entropy; plain and smoothed
//! targets are built on the host as dense distributions.

use burn::tensor::{activation, backend::Backend, Tensor, TensorData};

use crate::config::RunConfig;
use crate::model::ModelOutput;

/// Training targets of a labeled batch
#[derive(Debug, Clone)]
pub enum Targets<B: Backend> {
    /// Class indices, turned into (smoothed) one-hot rows by the criterion
    Hard(Vec<usize>),
    /// Dense `[N, K]` distributions, already smoothed
    Soft(Tensor<B, 2>),
}

/// `(1 - s) * onehot + s / K`, row-major `[N, K]`
pub fn smoothed_one_hot(labels: &[usize], num_classes: usize, smoothing: f64) -> Vec<f32> {
    let off = (smoothing / num_classes as f64) as f32;
    let on = (1.0 - smoothing) as f32 + off;
    let mut out = vec![off; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        out[row * num_classes + label] = on;
    }
    out
}

pub fn dense_targets<B: Backend>(
    labels: &[usize],
    num_classes: usize,
    smoothing: f64,
    device: &B::Device,
) -> Tensor<B, 2> {
    let data = TensorData::new(
        smoothed_one_hot(labels, num_classes, smoothing),
        [labels.len(), num_classes],
    );
    Tensor::from_data(data, device)
}

/// `mean_n sum_k -t[n,k] * log_softmax(z)[n,k]`
pub fn soft_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_probs = activation::log_softmax(logits, 1);
    (targets * log_probs).sum_dim(1).mean().neg()
}

/// `T^2 * mean_n KL(softmax(teacher / T) || softmax(student / T))`, teacher side detached
pub fn distillation_kl<B: Backend>(
    student: Tensor<B, 2>,
    teacher: Tensor<B, 2>,
    temperature: f64,
) -> Tensor<B, 1> {
    let teacher = teacher.detach() / temperature;
    let teacher_log = activation::log_softmax(teacher.clone(), 1);
    let teacher_probs = activation::softmax(teacher, 1);
    let student_log = activation::log_softmax(student / temperature, 1);
    (teacher_probs * (teacher_log - student_log))
        .sum_dim(1)
        .mean()
        .mul_scalar(temperature * temperature)
}

/// The supervised criterion of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrimaryCriterion {
    SoftTarget { smoothing: f64 },
    LabelSmoothing { smoothing: f64 },
    Plain,
}

impl PrimaryCriterion {
    pub fn select(config: &RunConfig) -> Self {
        let smoothing = config.augment.smoothing;
        if config.mixup_active() {
            Self::SoftTarget { smoothing }
        } else if smoothing > 0.0 {
            Self::LabelSmoothing { smoothing }
        } else {
            Self::Plain
        }
    }

    pub fn smoothing(&self) -> f64 {
        match self {
            Self::SoftTarget { smoothing } | Self::LabelSmoothing { smoothing } => *smoothing,
            Self::Plain => 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SoftTarget { .. } => "soft_target_ce",
            Self::LabelSmoothing { .. } => "label_smoothing_ce",
            Self::Plain => "ce",
        }
    }

    /// Dense targets for `targets`
    pub fn dense<B: Backend>(&self, targets: &Targets<B>, num_classes: usize, device: &B::Device) -> Tensor<B, 2> {
        match targets {
            Targets::Hard(labels) => dense_targets(labels, num_classes, self.smoothing(), device),
            Targets::Soft(dense) => dense.clone(),
        }
    }

    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: &Targets<B>) -> Tensor<B, 1> {
        let [_, num_classes] = logits.dims();
        let dense = self.dense(targets, num_classes, &logits.device());
        soft_cross_entropy(logits, dense)
    }
}

/// The distillation-style term of a run; at most one is active
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistillationTerm {
    None,
    /// Branches learn from each other's softened predictions
    DeepMutual { weight: f64, temperature: f64 },
    /// Branches learn from the detached branch ensemble
    One { weight: f64, temperature: f64 },
    /// The ensemble is supervised; branches follow the ensemble
    MulMixture { beta: f64, temperature: f64 },
    /// The first branch teaches the others
    SelfDistillation { weight: f64, temperature: f64 },
}

/// Supervised part of a step
pub struct SupervisedLoss<B: Backend> {
    pub primary: Tensor<B, 1>,
    pub distillation: Option<Tensor<B, 1>>,
}

impl DistillationTerm {
    pub fn select(config: &RunConfig) -> Self {
        let l = &config.loss;
        let temperature = l.kd_temp;
        if l.dml_w > 0.0 {
            Self::DeepMutual {
                weight: l.dml_w,
                temperature,
            }
        } else if l.one_w > 0.0 {
            Self::One {
                weight: l.one_w,
                temperature,
            }
        } else if l.mulmix_b > 0.0 {
            Self::MulMixture {
                beta: l.mulmix_b,
                temperature,
            }
        } else if l.selfdis_w > 0.0 {
            Self::SelfDistillation {
                weight: l.selfdis_w,
                temperature,
            }
        } else {
            Self::None
        }
    }

    /// Log name of the distillation component
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::DeepMutual { .. } => Some("dml"),
            Self::One { .. } => Some("one"),
            Self::MulMixture { .. } => Some("mulmix"),
            Self::SelfDistillation { .. } => Some("selfdis"),
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::DeepMutual { weight, .. }
            | Self::One { weight, .. }
            | Self::SelfDistillation { weight, .. } => *weight,
            Self::MulMixture { beta, .. } => *beta,
        }
    }

    pub fn forward<B: Backend>(
        &self,
        criterion: &PrimaryCriterion,
        output: &ModelOutput<B>,
        targets: &Targets<B>,
    ) -> SupervisedLoss<B> {
        let branches = &output.branches;
        let [_, num_classes] = output.logits.dims();
        let dense = criterion.dense(targets, num_classes, &output.logits.device());
        let ce = |logits: &Tensor<B, 2>| soft_cross_entropy(logits.clone(), dense.clone());
        let branch_ce = || mean_of(branches.iter().map(|b| ce(b)).collect());

        match *self {
            Self::None => SupervisedLoss {
                primary: ce(&output.logits),
                distillation: None,
            },
            Self::DeepMutual { temperature, .. } => {
                let mut pairs = Vec::new();
                for (i, student) in branches.iter().enumerate() {
                    for (j, teacher) in branches.iter().enumerate() {
                        if i != j {
                            pairs.push(distillation_kl(student.clone(), teacher.clone(), temperature));
                        }
                    }
                }
                SupervisedLoss {
                    primary: branch_ce(),
                    distillation: Some(mean_of(pairs)),
                }
            }
            Self::One { temperature, .. } => {
                let kd = branches
                    .iter()
                    .map(|b| distillation_kl(b.clone(), output.logits.clone(), temperature))
                    .collect();
                SupervisedLoss {
                    primary: branch_ce() + ce(&output.logits),
                    distillation: Some(mean_of(kd)),
                }
            }
            Self::MulMixture { temperature, .. } => {
                let kd = branches
                    .iter()
                    .map(|b| distillation_kl(b.clone(), output.logits.clone(), temperature))
                    .collect();
                SupervisedLoss {
                    primary: ce(&output.logits),
                    distillation: Some(mean_of(kd)),
                }
            }
            Self::SelfDistillation { temperature, .. } => {
                let kd = branches
                    .iter()
                    .skip(1)
                    .map(|b| distillation_kl(b.clone(), branches[0].clone(), temperature))
                    .collect();
                SupervisedLoss {
                    primary: branch_ce(),
                    distillation: Some(mean_of(kd)),
                }
            }
        }
    }
}

/// Mean of scalar losses; a single zero when there are none
pub(crate) fn mean_of<B: Backend>(values: Vec<Tensor<B, 1>>) -> Tensor<B, 1> {
    let count = values.len();
    let mut iter = values.into_iter();
    match iter.next() {
        Some(first) => iter.fold(first, |acc, v| acc + v) / count as f64,
        None => Tensor::zeros([1], &Default::default()),
    }
}
