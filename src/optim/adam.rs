use serde::{Deserialize, Serialize};

use crate::layers::Param;

/// Adam optimiser with a single global step counter.
///
/// Per-parameter moments live in each [`Param`]; this struct only carries
/// the hyperparameters and the number of updates applied so far, which is
/// what the bias correction needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: u64,
}

impl Adam {
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Self { lr, beta1, beta2, eps, t: 0 }
    }

    /// Adam with the usual `beta2 = 0.999`, `eps = 1e-8`.
    pub fn with_beta1(lr: f32, beta1: f32) -> Self {
        Self::new(lr, beta1, 0.999, 1e-8)
    }

    /// Number of updates applied so far.
    pub fn iterations(&self) -> u64 {
        self.t
    }

    pub fn step(&mut self, params: &mut [&mut Param]) {
        self.t += 1;
        for p in params.iter_mut() {
            p.adam_step(self.lr, self.beta1, self.beta2, self.eps, self.t);
        }
    }
}
