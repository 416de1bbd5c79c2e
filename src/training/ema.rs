//! Exponential moving average of model weights
//!
//! [`decay_update`] is a pure function over two modules of the same
//! architecture: `shadow' = decay * shadow + (1 - decay) * live`, parameter by
//! parameter in visiting order. [`ShadowModel`] owns the averaged copy.

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, ParamId},
    tensor::{backend::Backend, Tensor},
};

struct Collect<B: Backend> {
    params: Vec<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for Collect<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let n = tensor.shape().num_elements();
        self.params.push(tensor.clone().reshape([n]));
    }
}

struct Blend<B: Backend> {
    live: std::vec::IntoIter<Tensor<B, 1>>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.live.next() {
            Some(live) => {
                let live: Tensor<B, D> = live.reshape(tensor.dims());
                tensor * self.decay + live * (1.0 - self.decay)
            }
            None => tensor,
        }
    }
}

/// Blend the parameters of `live` into `shadow`
pub fn decay_update<B: Backend, M: Module<B>>(shadow: M, live: &M, decay: f64) -> M {
    let mut collect = Collect { params: Vec::new() };
    live.visit(&mut collect);
    let mut blend = Blend {
        live: collect.params.into_iter(),
        decay,
    };
    shadow.map(&mut blend)
}

/// Averaged copy of a model, owned by the driver
#[derive(Debug, Clone)]
pub struct ShadowModel<M> {
    module: M,
    decay: f64,
}

impl<M> ShadowModel<M> {
    pub fn new(module: M, decay: f64) -> Self {
        Self { module, decay }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn replace(&mut self, module: M) {
        self.module = module;
    }

    pub fn update<B: Backend>(&mut self, live: &M)
    where
        M: Module<B>,
    {
        self.module = decay_update(self.module.clone(), live, self.decay);
    }
}
