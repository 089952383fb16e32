use rand::Rng;
use serde::{Deserialize, Serialize};

use super::param::Param;
use crate::math::Matrix;

// Dense layer `y = xW + b`. During training the last input is kept so the
// backward pass can form the weight gradient; inference never touches it.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinearT {
    pub w: Param,
    pub b: Param,
    in_dim: usize,
    out_dim: usize,
    #[serde(skip)]
    last_x: Matrix,
}

impl LinearT {
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        Self {
            w: Param::glorot(in_dim * out_dim, in_dim, out_dim, rng),
            b: Param::filled(out_dim, 0.0),
            in_dim,
            out_dim,
            last_x: Matrix::zeros(0, 0),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn weight(&self) -> Matrix {
        Matrix::from_vec(self.in_dim, self.out_dim, self.w.w.clone())
    }

    pub fn forward(&self, x: &Matrix) -> Matrix {
        let mut out = Matrix::matmul(x, &self.weight());
        for r in 0..out.rows {
            for (o, &b) in out.data[r * self.out_dim..(r + 1) * self.out_dim]
                .iter_mut()
                .zip(self.b.w.iter())
            {
                *o += b;
            }
        }
        out
    }

    /// Forward pass that remembers `x` for [`LinearT::backward`].
    pub fn forward_train(&mut self, x: &Matrix) -> Matrix {
        self.last_x = x.clone();
        self.forward(x)
    }

    /// Accumulate weight and bias gradients and return the input gradient.
    pub fn backward(&mut self, grad_out: &Matrix) -> Matrix {
        let grad_w = Matrix::matmul(&self.last_x.transpose(), grad_out);
        for (g, d) in self.w.grad_mut().iter_mut().zip(grad_w.data.iter()) {
            *g += d;
        }
        let gb = self.b.grad_mut();
        for r in 0..grad_out.rows {
            for (g, d) in gb.iter_mut().zip(grad_out.row(r)) {
                *g += d;
            }
        }
        Matrix::matmul(grad_out, &self.weight().transpose())
    }

    pub fn zero_grad(&mut self) {
        self.w.zero_grad();
        self.b.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn forward_adds_bias() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut lin = LinearT::new(2, 1, &mut rng);
        lin.w.w = vec![1.0, 2.0];
        lin.b.w = vec![0.5];
        let out = lin.forward(&Matrix::from_vec(1, 2, vec![3.0, 4.0]));
        assert_eq!(out.data, vec![11.5]);
    }

    #[test]
    fn backward_accumulates_bias_over_batch() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut lin = LinearT::new(2, 1, &mut rng);
        lin.zero_grad();
        lin.forward_train(&Matrix::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]));
        lin.backward(&Matrix::from_vec(2, 1, vec![1.0, 2.0]));
        assert_eq!(lin.b.grad(), &[3.0]);
        assert_eq!(lin.w.grad(), &[1.0, 2.0]);
    }
}
