//! Loss composition
//!
//! `total = primary + sum_i weight_i * term_i` over the enabled terms. The
//! composition is generic over the value type so the same code sums tensors
//! during training and plain numbers in tests.
//!
//! [`LossPlan`] fixes, once per run, which terms exist at all.

use std::ops::{Add, Mul};

use crate::config::RunConfig;
use crate::training::contrastive::SimclrTerm;
use crate::training::criterion::{DistillationTerm, PrimaryCriterion};
use crate::training::pseudo_label::PseudoLabelTerm;

/// One weighted auxiliary contribution
#[derive(Debug, Clone)]
pub struct WeightedTerm<T> {
    pub name: &'static str,
    pub weight: f64,
    pub value: T,
}

#[derive(Debug, Clone)]
pub struct LossComposition<T> {
    primary: T,
    terms: Vec<WeightedTerm<T>>,
}

impl<T> LossComposition<T>
where
    T: Clone + Add<Output = T> + Mul<f64, Output = T>,
{
    pub fn new(primary: T) -> Self {
        Self {
            primary,
            terms: Vec::new(),
        }
    }

    /// Add a term; terms with a non-positive weight are ignored
    pub fn add(&mut self, name: &'static str, weight: f64, value: T) {
        if weight > 0.0 {
            self.terms.push(WeightedTerm { name, weight, value });
        }
    }

    pub fn primary(&self) -> &T {
        &self.primary
    }

    pub fn terms(&self) -> &[WeightedTerm<T>] {
        &self.terms
    }

    pub fn total(&self) -> T {
        self.terms
            .iter()
            .fold(self.primary.clone(), |acc, term| acc + term.value.clone() * term.weight)
    }

    /// Apply `f` to the primary value and every term, keeping names and weights
    pub fn map<U, F: FnMut(&T) -> U>(&self, mut f: F) -> LossComposition<U> {
        LossComposition {
            primary: f(&self.primary),
            terms: self
                .terms
                .iter()
                .map(|t| WeightedTerm {
                    name: t.name,
                    weight: t.weight,
                    value: f(&t.value),
                })
                .collect(),
        }
    }
}

/// Unlabeled terms enabled for a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnlabeledTerms {
    /// `(weight, term)`
    pub simclr: Option<(f64, SimclrTerm)>,
    pub branch_div: Option<f64>,
    pub simsiam: Option<f64>,
    /// `(weight, temperature)`
    pub moco: Option<(f64, f64)>,
    pub byol: Option<f64>,
    pub pseudo_label: Option<PseudoLabelTerm>,
}

impl UnlabeledTerms {
    pub fn any(&self) -> bool {
        self.simclr.is_some()
            || self.branch_div.is_some()
            || self.simsiam.is_some()
            || self.moco.is_some()
            || self.byol.is_some()
            || self.pseudo_label.is_some()
    }
}

/// Every loss term of a run, decided once at setup
#[derive(Debug, Clone, PartialEq)]
pub struct LossPlan {
    pub primary: PrimaryCriterion,
    pub distillation: DistillationTerm,
    pub unlabeled: UnlabeledTerms,
    /// First epoch in which the unlabeled terms contribute
    pub unlabeled_from: usize,
}

impl LossPlan {
    pub fn from_config(config: &RunConfig) -> Self {
        let l = &config.loss;
        let positive = |w: f64| (w > 0.0).then_some(w);

        let unlabeled = UnlabeledTerms {
            simclr: positive(l.simclr_w).map(|w| {
                (
                    w,
                    SimclrTerm {
                        temperature: l.temperature,
                        gamma: l.gamma,
                        beta: l.beta,
                        group_loss: !l.no_group_loss,
                    },
                )
            }),
            branch_div: positive(l.branch_div_w),
            simsiam: positive(l.simsiam_w),
            moco: positive(l.moco_w).map(|w| (w, l.temperature)),
            byol: positive(l.byol_w),
            pseudo_label: (l.use_pl_loss && l.pl_w > 0.0).then_some(PseudoLabelTerm {
                threshold: l.threshold,
                weight: l.pl_w,
            }),
        };

        Self {
            primary: PrimaryCriterion::select(config),
            distillation: DistillationTerm::select(config),
            unlabeled,
            unlabeled_from: config.schedule.sup_thresh,
        }
    }

    /// The unlabeled batch needs a forward pass in `epoch`
    pub fn unlabeled_active(&self, epoch: usize) -> bool {
        self.unlabeled.any() && epoch >= self.unlabeled_from
    }

    /// Names of the enabled terms, for the startup banner
    pub fn describe(&self) -> String {
        let mut parts = vec![self.primary.name().to_string()];
        if let Some(name) = self.distillation.name() {
            parts.push(format!("{} x{}", name, self.distillation.weight()));
        }
        let u = &self.unlabeled;
        if let Some((w, _)) = u.simclr {
            parts.push(format!("simclr x{}", w));
        }
        if let Some(w) = u.branch_div {
            parts.push(format!("branch_div x{}", w));
        }
        if let Some(w) = u.simsiam {
            parts.push(format!("simsiam x{}", w));
        }
        if let Some((w, _)) = u.moco {
            parts.push(format!("moco x{}", w));
        }
        if let Some(w) = u.byol {
            parts.push(format!("byol x{}", w));
        }
        if let Some(pl) = u.pseudo_label {
            parts.push(format!("pl x{} (>{})", pl.weight, pl.threshold));
        }
        parts.join(" + ")
    }
}
