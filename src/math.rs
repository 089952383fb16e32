use serde::{Deserialize, Serialize};

/// Row-major `f32` matrix. Image batches use one row per sample with the
/// channels, rows and columns of the image flattened in that order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn zeros(r: usize, c: usize) -> Self {
        Matrix {
            rows: r,
            cols: c,
            data: vec![0.0; r * c],
        }
    }

    pub fn from_vec(r: usize, c: usize, v: Vec<f32>) -> Self {
        assert_eq!(v.len(), r * c);
        Matrix {
            rows: r,
            cols: c,
            data: v,
        }
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
        assert_eq!(a.cols, b.rows);
        let mut out = vec![0.0; a.rows * b.cols];
        for i in 0..a.rows {
            let a_row = &a.data[i * a.cols..(i + 1) * a.cols];
            let out_row = &mut out[i * b.cols..(i + 1) * b.cols];
            for (k, &a_val) in a_row.iter().enumerate() {
                if a_val == 0.0 {
                    continue;
                }
                let b_row = &b.data[k * b.cols..(k + 1) * b.cols];
                for (o, &b_val) in out_row.iter_mut().zip(b_row) {
                    *o += a_val * b_val;
                }
            }
        }
        Matrix::from_vec(a.rows, b.cols, out)
    }

    pub fn add(&self, other: &Matrix) -> Matrix {
        assert_eq!(self.rows, other.rows);
        assert_eq!(self.cols, other.cols);
        let v = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Matrix::from_vec(self.rows, self.cols, v)
    }

    pub fn transpose(&self) -> Matrix {
        let mut v = vec![0.0; self.rows * self.cols];
        for i in 0..self.rows {
            for j in 0..self.cols {
                v[j * self.rows + i] = self.get(i, j);
            }
        }
        Matrix::from_vec(self.cols, self.rows, v)
    }

    /// Copy of columns `start..end` of every row.
    pub fn slice_cols(&self, start: usize, end: usize) -> Matrix {
        assert!(start <= end && end <= self.cols);
        let width = end - start;
        let mut v = Vec::with_capacity(self.rows * width);
        for r in 0..self.rows {
            v.extend_from_slice(&self.row(r)[start..end]);
        }
        Matrix::from_vec(self.rows, width, v)
    }

    /// Rows `start..end` as a new matrix.
    pub fn slice_rows(&self, start: usize, end: usize) -> Matrix {
        assert!(start <= end && end <= self.rows);
        Matrix::from_vec(end - start, self.cols, self.data[start * self.cols..end * self.cols].to_vec())
    }

    /// Place `right`'s columns after `left`'s, row by row.
    pub fn concat_cols(left: &Matrix, right: &Matrix) -> Matrix {
        assert_eq!(left.rows, right.rows);
        let cols = left.cols + right.cols;
        let mut v = Vec::with_capacity(left.rows * cols);
        for r in 0..left.rows {
            v.extend_from_slice(left.row(r));
            v.extend_from_slice(right.row(r));
        }
        Matrix::from_vec(left.rows, cols, v)
    }
}

const PROB_EPS: f32 = 1e-7;

/// Bernoulli negative log-likelihood of `data` under `pred`, summed over the
/// pixels of each sample and averaged over the batch.
///
/// `pred` must be the output of a sigmoid. The returned gradient is taken
/// with respect to the logits that fed that sigmoid, `(pred - data) / batch`,
/// which stays finite even when `pred` saturates.
pub fn binary_cross_entropy(data: &Matrix, pred: &Matrix) -> (f32, Matrix) {
    assert_eq!(data.rows, pred.rows);
    assert_eq!(data.cols, pred.cols);
    let batch = data.rows.max(1) as f32;
    let mut loss = 0.0f64;
    let mut grad = Matrix::zeros(pred.rows, pred.cols);
    for i in 0..data.data.len() {
        let x = data.data[i];
        let p = pred.data[i].clamp(PROB_EPS, 1.0 - PROB_EPS);
        loss -= (x * p.ln() + (1.0 - x) * (1.0 - p).ln()) as f64;
        grad.data[i] = (pred.data[i] - x) / batch;
    }
    ((loss / batch as f64) as f32, grad)
}

/// KL divergence between `N(mean, exp(log_sigma)^2)` and the standard normal,
/// summed over latent dimensions and averaged over the batch.
///
/// Returns the loss together with its gradients for `mean` and `log_sigma`.
pub fn gaussian_kl(mean: &Matrix, log_sigma: &Matrix) -> (f32, Matrix, Matrix) {
    assert_eq!(mean.rows, log_sigma.rows);
    assert_eq!(mean.cols, log_sigma.cols);
    let batch = mean.rows.max(1) as f32;
    let mut loss = 0.0f64;
    let mut grad_mean = Matrix::zeros(mean.rows, mean.cols);
    let mut grad_log_sigma = Matrix::zeros(mean.rows, mean.cols);
    for i in 0..mean.data.len() {
        let m = mean.data[i];
        let ls = log_sigma.data[i];
        let var = (2.0 * ls).exp();
        loss += (m * m + var - 2.0 * ls - 1.0) as f64;
        grad_mean.data[i] = m / batch;
        grad_log_sigma.data[i] = (var - 1.0) / batch;
    }
    ((0.5 * loss / batch as f64) as f32, grad_mean, grad_log_sigma)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_matches_hand_computation() {
        let a = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let b = Matrix::from_vec(2, 1, vec![5.0, 6.0]);
        assert_eq!(Matrix::matmul(&a, &b).data, vec![17.0, 39.0]);
    }

    #[test]
    fn slice_and_concat_are_inverse() {
        let m = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let left = m.slice_cols(0, 1);
        let right = m.slice_cols(1, 3);
        assert_eq!(left.data, vec![1.0, 4.0]);
        assert_eq!(Matrix::concat_cols(&left, &right), m);
    }

    #[test]
    fn row_slices_keep_whole_rows() {
        let m = Matrix::from_vec(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let tail = m.slice_rows(1, 3);
        assert_eq!((tail.rows, tail.cols), (2, 2));
        assert_eq!(tail.data, vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(m.slice_rows(2, 2).rows, 0);
    }

    #[test]
    fn kl_vanishes_for_standard_normal() {
        let mean = Matrix::zeros(3, 4);
        let log_sigma = Matrix::zeros(3, 4);
        let (loss, gm, gs) = gaussian_kl(&mean, &log_sigma);
        assert!(loss.abs() < 1e-7);
        assert!(gm.data.iter().chain(gs.data.iter()).all(|g| g.abs() < 1e-7));
    }

    #[test]
    fn kl_gradient_matches_finite_difference() {
        let mean = Matrix::from_vec(2, 2, vec![0.3, -0.7, 1.2, 0.1]);
        let log_sigma = Matrix::from_vec(2, 2, vec![-0.2, 0.4, 0.0, -1.0]);
        let (_, gm, gs) = gaussian_kl(&mean, &log_sigma);
        let h = 1e-3;
        for i in 0..4 {
            let mut plus = log_sigma.clone();
            let mut minus = log_sigma.clone();
            plus.data[i] += h;
            minus.data[i] -= h;
            let numeric = (gaussian_kl(&mean, &plus).0 - gaussian_kl(&mean, &minus).0) / (2.0 * h);
            assert!((numeric - gs.data[i]).abs() < 1e-2, "log_sigma[{i}]");

            let mut plus = mean.clone();
            let mut minus = mean.clone();
            plus.data[i] += h;
            minus.data[i] -= h;
            let numeric = (gaussian_kl(&plus, &log_sigma).0 - gaussian_kl(&minus, &log_sigma).0) / (2.0 * h);
            assert!((numeric - gm.data[i]).abs() < 1e-2, "mean[{i}]");
        }
    }

    #[test]
    fn bce_is_small_for_confident_correct_predictions() {
        let data = Matrix::from_vec(1, 2, vec![1.0, 0.0]);
        let good = Matrix::from_vec(1, 2, vec![0.999, 0.001]);
        let bad = Matrix::from_vec(1, 2, vec![0.001, 0.999]);
        let (good_loss, _) = binary_cross_entropy(&data, &good);
        let (bad_loss, _) = binary_cross_entropy(&data, &bad);
        assert!(good_loss < 0.01);
        assert!(bad_loss > 10.0);
    }

    #[test]
    fn bce_stays_finite_at_saturation() {
        let data = Matrix::from_vec(1, 2, vec![1.0, 0.0]);
        let pred = Matrix::from_vec(1, 2, vec![0.0, 1.0]);
        let (loss, grad) = binary_cross_entropy(&data, &pred);
        assert!(loss.is_finite());
        assert_eq!(grad.data, vec![-1.0, 1.0]);
    }

    #[test]
    fn bce_averages_over_batch() {
        let data = Matrix::from_vec(2, 1, vec![1.0, 1.0]);
        let pred = Matrix::from_vec(2, 1, vec![0.5, 0.5]);
        let (loss, grad) = binary_cross_entropy(&data, &pred);
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
        assert_eq!(grad.data, vec![-0.25, -0.25]);
    }
}
