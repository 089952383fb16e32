use rand::Rng;
use serde::{Deserialize, Serialize};

/// Flat trainable tensor with its gradient and Adam moment estimates.
///
/// The moments are serialised together with the weights so that a restored
/// checkpoint continues optimisation exactly where it stopped. Gradients are
/// transient and are rebuilt lazily after loading.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Param {
    pub w: Vec<f32>,
    #[serde(skip)]
    grad: Vec<f32>,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Param {
    pub fn filled(dim: usize, init: f32) -> Self {
        Self {
            w: vec![init; dim],
            grad: vec![0.0; dim],
            m: vec![0.0; dim],
            v: vec![0.0; dim],
        }
    }

    /// Glorot/Xavier uniform initialisation for a weight with the given fans.
    pub fn glorot<R: Rng + ?Sized>(dim: usize, fan_in: usize, fan_out: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
        let mut p = Self::filled(dim, 0.0);
        for w in p.w.iter_mut() {
            *w = rng.gen_range(-limit..=limit);
        }
        p
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    /// Mutable gradient buffer, resized to match the weights if needed.
    pub fn grad_mut(&mut self) -> &mut [f32] {
        if self.grad.len() != self.w.len() {
            self.grad = vec![0.0; self.w.len()];
        }
        &mut self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad.clear();
        self.grad.resize(self.w.len(), 0.0);
    }

    /// Adam update using bias-corrected moments for global step `t`.
    pub fn adam_step(&mut self, lr: f32, beta1: f32, beta2: f32, eps: f32, t: u64) {
        if self.m.len() != self.w.len() {
            self.m = vec![0.0; self.w.len()];
            self.v = vec![0.0; self.w.len()];
        }
        if self.grad.len() != self.w.len() {
            return;
        }
        let t = t.max(1) as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);
        for i in 0..self.w.len() {
            let g = self.grad[i];
            self.m[i] = beta1 * self.m[i] + (1.0 - beta1) * g;
            self.v[i] = beta2 * self.v[i] + (1.0 - beta2) * g * g;
            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;
            self.w[i] -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }
}
