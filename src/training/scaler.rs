//! Dynamic loss scaling
//!
//! The loss is multiplied by the current scale before backpropagation and
//! the gradients are divided by it afterwards. A step whose unscaled
//! gradients contain an inf or NaN is skipped and the scale backs off; after
//! `growth_interval` clean steps in a row the scale grows again.
//!
//! Gradient clipping lives here as well since it must only ever see unscaled
//! gradients.

use std::marker::PhantomData;

use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::GradientsParams,
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use serde::{Deserialize, Serialize};

pub const INITIAL_SCALE: f64 = 65536.0;
pub const GROWTH_FACTOR: f64 = 2.0;
pub const BACKOFF_FACTOR: f64 = 0.5;
pub const GROWTH_INTERVAL: usize = 2000;

/// Serializable scaler state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f64,
    pub growth_tracker: usize,
}

#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    scale: f64,
    growth_tracker: usize,
}

/// Gradients after unscaling
pub struct UnscaledGrads {
    pub grads: GradientsParams,
    /// Global L2 norm of the unscaled gradients
    pub norm: f64,
    /// Some gradient is inf or NaN
    pub overflow: bool,
}

impl LossScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { INITIAL_SCALE } else { 1.0 },
            growth_tracker: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn state(&self) -> ScalerState {
        ScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    pub fn load_state(&mut self, state: ScalerState) {
        if self.enabled {
            self.scale = state.scale;
            self.growth_tracker = state.growth_tracker;
        }
    }

    pub fn scale_loss<B: AutodiffBackend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled {
            loss * self.scale
        } else {
            loss
        }
    }

    /// Divide every gradient of `model` by the scale and measure the global norm
    pub fn unscale<B, M>(&self, model: &M, grads: GradientsParams) -> UnscaledGrads
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut visitor = GradScaleVisitor::<B> {
            grads,
            factor: 1.0 / self.scale,
            sq_sum: 0.0,
            finite: true,
            _backend: PhantomData,
        };
        model.visit(&mut visitor);
        let norm = visitor.sq_sum.sqrt();
        UnscaledGrads {
            grads: visitor.grads,
            norm,
            overflow: !visitor.finite || !norm.is_finite(),
        }
    }

    /// Record the outcome of a step
    pub fn update(&mut self, overflow: bool) {
        if !self.enabled {
            return;
        }
        if overflow {
            self.scale *= BACKOFF_FACTOR;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.growth_tracker = 0;
            }
        }
    }
}

/// Scale gradients so their global norm is at most `max_norm`
pub fn clip_grad_norm<B, M>(model: &M, grads: GradientsParams, norm: f64, max_norm: f64) -> GradientsParams
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    if norm <= max_norm {
        return grads;
    }
    let mut visitor = GradScaleVisitor::<B> {
        grads,
        factor: max_norm / (norm + 1e-6),
        sq_sum: 0.0,
        finite: true,
        _backend: PhantomData,
    };
    model.visit(&mut visitor);
    visitor.grads
}

struct GradScaleVisitor<B: AutodiffBackend> {
    grads: GradientsParams,
    factor: f64,
    sq_sum: f64,
    finite: bool,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradScaleVisitor<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = if self.factor == 1.0 { grad } else { grad * self.factor };
        let sq: f64 = grad.clone().powf_scalar(2.0).sum().into_scalar().elem();
        if sq.is_finite() {
            self.sq_sum += sq;
        } else {
            self.finite = false;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Param;
    use burn::nn::{Linear, LinearConfig};
    use burn::tensor::TensorData;

    type TestBackend = Autodiff<NdArray>;

    fn linear_with_grads(scale: f32) -> (Linear<TestBackend>, GradientsParams) {
        let device = Default::default();
        let mut linear: Linear<TestBackend> = LinearConfig::new(2, 1).with_bias(false).init(&device);
        linear.weight = Param::from_tensor(Tensor::from_data(TensorData::new(vec![1.0f32, 1.0], [2, 1]), &device));
        let x = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![3.0f32, 4.0], [1, 2]), &device);
        // d(scale * x.w)/dw = scale * x
        let loss = linear.forward(x).sum() * scale;
        let grads = GradientsParams::from_grads(loss.backward(), &linear);
        (linear, grads)
    }

    #[test]
    fn test_growth_and_backoff() {
        let mut scaler = LossScaler::new(true);
        assert_eq!(scaler.scale(), INITIAL_SCALE);
        scaler.update(true);
        assert_eq!(scaler.scale(), INITIAL_SCALE / 2.0);
        for _ in 0..GROWTH_INTERVAL {
            scaler.update(false);
        }
        assert_eq!(scaler.scale(), INITIAL_SCALE);
        assert_eq!(scaler.state().growth_tracker, 0);
    }

    #[test]
    fn test_disabled_scaler_is_identity() {
        let mut scaler = LossScaler::new(false);
        scaler.update(true);
        scaler.load_state(ScalerState {
            scale: 8.0,
            growth_tracker: 3,
        });
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_unscale_recovers_true_norm() {
        let (linear, grads) = linear_with_grads(1024.0);
        let mut scaler = LossScaler::new(true);
        scaler.load_state(ScalerState {
            scale: 1024.0,
            growth_tracker: 0,
        });
        let unscaled = scaler.unscale::<TestBackend, _>(&linear, grads);
        assert!(!unscaled.overflow);
        assert!((unscaled.norm - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_overflow_detected() {
        let (linear, grads) = linear_with_grads(f32::INFINITY);
        let unscaled = LossScaler::new(true).unscale::<TestBackend, _>(&linear, grads);
        assert!(unscaled.overflow);
    }

    #[test]
    fn test_clip_grad_norm() {
        let (linear, grads) = linear_with_grads(1.0);
        let grads = clip_grad_norm::<TestBackend, _>(&linear, grads, 5.0, 1.0);
        let check = LossScaler::new(false).unscale::<TestBackend, _>(&linear, grads);
        assert!((check.norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut scaler = LossScaler::new(true);
        scaler.update(false);
        let json = serde_json::to_string(&scaler.state()).unwrap();
        let state: ScalerState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, scaler.state());
    }
}
