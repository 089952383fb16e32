use serde::{Deserialize, Serialize};

use super::param::Param;
use crate::math::Matrix;

/// Default momentum of the running statistics.
pub const BN_MOMENTUM: f32 = 0.99;
/// Default variance epsilon.
pub const BN_EPS: f32 = 1e-3;

/// Batch normalization with learnable scale (`gamma`) and shift (`beta`).
///
/// Inputs hold `channels * spatial` features per row, channel-major, so a
/// dense activation uses `spatial == 1` and a convolutional feature map uses
/// `spatial == height * width`. Statistics are shared by every position of a
/// channel across the whole batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Param,
    pub beta: Param,
    channels: usize,
    spatial: usize,
    eps: f32,
    momentum: f32,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    #[serde(skip)]
    x_hat: Matrix,
    #[serde(skip)]
    inv_std: Vec<f32>,
}

impl BatchNorm {
    pub fn new(channels: usize, spatial: usize, eps: f32, momentum: f32) -> Self {
        Self {
            gamma: Param::filled(channels, 1.0),
            beta: Param::filled(channels, 0.0),
            channels,
            spatial,
            eps,
            momentum,
            running_mean: vec![0.0; channels],
            running_var: vec![1.0; channels],
            x_hat: Matrix::zeros(0, 0),
            inv_std: Vec::new(),
        }
    }

    /// Batch norm for dense activations of width `dim`.
    pub fn dense(dim: usize) -> Self {
        Self::new(dim, 1, BN_EPS, BN_MOMENTUM)
    }

    /// Batch norm for `channels` feature maps of `spatial` pixels each.
    pub fn spatial(channels: usize, spatial: usize) -> Self {
        Self::new(channels, spatial, BN_EPS, BN_MOMENTUM)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    pub fn running_var(&self) -> &[f32] {
        &self.running_var
    }

    fn offsets(&self, row: usize, c: usize) -> std::ops::Range<usize> {
        let start = row * self.channels * self.spatial + c * self.spatial;
        start..start + self.spatial
    }

    /// Inference-mode forward using the running statistics.
    pub fn forward(&self, x: &Matrix) -> Matrix {
        let mut out = x.clone();
        for r in 0..x.rows {
            for c in 0..self.channels {
                let inv_std = 1.0 / (self.running_var[c] + self.eps).sqrt();
                for v in out.data[self.offsets(r, c)].iter_mut() {
                    let x_hat = (*v - self.running_mean[c]) * inv_std;
                    *v = self.gamma.w[c] * x_hat + self.beta.w[c];
                }
            }
        }
        out
    }

    /// Training-mode forward: normalise with batch statistics and fold them
    /// into the running averages.
    pub fn forward_train(&mut self, x: &Matrix) -> Matrix {
        let n = (x.rows * self.spatial).max(1) as f32;
        let mut out = Matrix::zeros(x.rows, x.cols);
        self.x_hat = Matrix::zeros(x.rows, x.cols);
        self.inv_std = vec![0.0; self.channels];
        for c in 0..self.channels {
            let mut sum = 0.0;
            for r in 0..x.rows {
                sum += x.data[self.offsets(r, c)].iter().sum::<f32>();
            }
            let mean = sum / n;
            let mut var_sum = 0.0;
            for r in 0..x.rows {
                for &v in &x.data[self.offsets(r, c)] {
                    var_sum += (v - mean) * (v - mean);
                }
            }
            let var = var_sum / n;
            self.running_mean[c] = self.momentum * self.running_mean[c] + (1.0 - self.momentum) * mean;
            self.running_var[c] = self.momentum * self.running_var[c] + (1.0 - self.momentum) * var;

            let inv_std = 1.0 / (var + self.eps).sqrt();
            self.inv_std[c] = inv_std;
            for r in 0..x.rows {
                for idx in self.offsets(r, c) {
                    let x_hat = (x.data[idx] - mean) * inv_std;
                    self.x_hat.data[idx] = x_hat;
                    out.data[idx] = self.gamma.w[c] * x_hat + self.beta.w[c];
                }
            }
        }
        out
    }

    pub fn backward(&mut self, grad_out: &Matrix) -> Matrix {
        let n = (grad_out.rows * self.spatial).max(1) as f32;
        let mut grad_input = Matrix::zeros(grad_out.rows, grad_out.cols);
        for c in 0..self.channels {
            let mut sum_dy = 0.0;
            let mut sum_dy_xhat = 0.0;
            for r in 0..grad_out.rows {
                for idx in self.offsets(r, c) {
                    let dy = grad_out.data[idx];
                    sum_dy += dy;
                    sum_dy_xhat += dy * self.x_hat.data[idx];
                }
            }
            self.beta.grad_mut()[c] += sum_dy;
            self.gamma.grad_mut()[c] += sum_dy_xhat;

            let gamma = self.gamma.w[c];
            let inv_std = self.inv_std[c];
            for r in 0..grad_out.rows {
                for idx in self.offsets(r, c) {
                    let dy = grad_out.data[idx];
                    grad_input.data[idx] = gamma * inv_std / n
                        * (n * dy - sum_dy - self.x_hat.data[idx] * sum_dy_xhat);
                }
            }
        }
        grad_input
    }

    pub fn zero_grad(&mut self) {
        self.gamma.zero_grad();
        self.beta.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_output_is_normalised_per_channel() {
        let mut bn = BatchNorm::new(2, 2, 1e-5, 0.9);
        let x = Matrix::from_vec(2, 4, vec![1.0, 3.0, 10.0, 10.0, 5.0, 7.0, 20.0, 20.0]);
        let out = bn.forward_train(&x);
        let ch0: Vec<f32> = vec![out.data[0], out.data[1], out.data[4], out.data[5]];
        let mean: f32 = ch0.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        let var: f32 = ch0.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn running_statistics_follow_momentum() {
        let mut bn = BatchNorm::new(1, 1, 1e-5, 0.5);
        bn.forward_train(&Matrix::from_vec(2, 1, vec![2.0, 4.0]));
        assert!((bn.running_mean()[0] - 1.5).abs() < 1e-6);
        assert!((bn.running_var()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn inference_uses_running_statistics() {
        let bn = BatchNorm::new(1, 1, 0.0, 0.99);
        let x = Matrix::from_vec(2, 1, vec![2.0, 4.0]);
        assert_eq!(bn.forward(&x).data, vec![2.0, 4.0]);
    }

    #[test]
    fn input_gradient_sums_to_zero() {
        let mut bn = BatchNorm::spatial(1, 3);
        bn.forward_train(&Matrix::from_vec(1, 3, vec![0.5, -1.0, 2.0]));
        let g = bn.backward(&Matrix::from_vec(1, 3, vec![1.0, 2.0, 3.0]));
        assert!(g.data.iter().sum::<f32>().abs() < 1e-4);
        assert_eq!(bn.beta.grad(), &[6.0]);
    }
}
