use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaeError};
use crate::layers::{leaky_relu, relu, sigmoid};
use crate::layers::{BatchNorm, Conv2d, ConvTranspose2d, LinearT, Param};
use crate::math::{binary_cross_entropy, gaussian_kl, Matrix};
use crate::rng::{rng_from_env, rng_with};

const KERNEL: usize = 4;
const STRIDE: usize = 2;
const PADDING: usize = 1;

/// Architecture hyperparameters of [`ConvVae`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaeConfig {
    pub z_dim: usize,
    /// Side of the smallest feature map; images are `4 * min_res` square.
    pub min_res: usize,
    /// Channels of the smallest feature map.
    pub min_chans: usize,
    /// Channels after the first convolution and before the last.
    pub base_chans: usize,
    pub dense_units: usize,
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            z_dim: 10,
            min_res: 7,
            min_chans: 128,
            base_chans: 64,
            dense_units: 1024,
        }
    }
}

impl VaeConfig {
    pub fn image_side(&self) -> usize {
        4 * self.min_res
    }

    pub fn image_len(&self) -> usize {
        self.image_side() * self.image_side()
    }

    fn flat_len(&self) -> usize {
        self.min_res * self.min_res * self.min_chans
    }
}

/// Maps images to the mean and log standard deviation of `q(z|x)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Encoder {
    conv1: Conv2d,
    conv2: Conv2d,
    bn1: BatchNorm,
    dense1: LinearT,
    bn2: BatchNorm,
    dense2: LinearT,
    z_dim: usize,
    #[serde(skip)]
    masks: Vec<Vec<f32>>,
}

impl Encoder {
    pub fn new<R: Rng + ?Sized>(cfg: &VaeConfig, rng: &mut R) -> Self {
        Self {
            conv1: Conv2d::new(1, cfg.base_chans, KERNEL, STRIDE, PADDING, rng),
            conv2: Conv2d::new(cfg.base_chans, cfg.min_chans, KERNEL, STRIDE, PADDING, rng),
            bn1: BatchNorm::spatial(cfg.min_chans, cfg.min_res * cfg.min_res),
            dense1: LinearT::new(cfg.flat_len(), cfg.dense_units, rng),
            bn2: BatchNorm::dense(cfg.dense_units),
            dense2: LinearT::new(cfg.dense_units, 2 * cfg.z_dim, rng),
            z_dim: cfg.z_dim,
            masks: Vec::new(),
        }
    }

    fn split(&self, h: Matrix) -> (Matrix, Matrix) {
        (h.slice_cols(0, self.z_dim), h.slice_cols(self.z_dim, 2 * self.z_dim))
    }

    /// Inference pass using batch-norm running statistics.
    pub fn forward(&self, x: &Matrix) -> Result<(Matrix, Matrix)> {
        let mut h = self.conv1.forward(x)?;
        leaky_relu::forward_matrix(&mut h);
        let mut h = self.bn1.forward(&self.conv2.forward(&h)?);
        leaky_relu::forward_matrix(&mut h);
        let mut h = self.bn2.forward(&self.dense1.forward(&h));
        leaky_relu::forward_matrix(&mut h);
        Ok(self.split(self.dense2.forward(&h)))
    }

    pub fn forward_train(&mut self, x: &Matrix) -> Result<(Matrix, Matrix)> {
        self.masks.clear();
        let mut h = self.conv1.forward_train(x)?;
        self.masks.push(leaky_relu::forward_matrix(&mut h));
        let h = self.conv2.forward_train(&h)?;
        let mut h = self.bn1.forward_train(&h);
        self.masks.push(leaky_relu::forward_matrix(&mut h));
        let h = self.dense1.forward_train(&h);
        let mut h = self.bn2.forward_train(&h);
        self.masks.push(leaky_relu::forward_matrix(&mut h));
        let h = self.dense2.forward_train(&h);
        Ok(self.split(h))
    }

    /// Backpropagate the gradients of the latent mean and log standard
    /// deviation through the last [`Encoder::forward_train`].
    pub fn backward(&mut self, grad_mean: &Matrix, grad_log_sigma: &Matrix) -> Result<()> {
        let masks = std::mem::take(&mut self.masks);
        if masks.len() != 3 {
            return Err(VaeError::NoForwardPass);
        }
        let mut g = self.dense2.backward(&Matrix::concat_cols(grad_mean, grad_log_sigma));
        leaky_relu::backward(&mut g, &masks[2]);
        let g = self.bn2.backward(&g);
        let mut g = self.dense1.backward(&g);
        leaky_relu::backward(&mut g, &masks[1]);
        let g = self.bn1.backward(&g);
        let mut g = self.conv2.backward(&g);
        leaky_relu::backward(&mut g, &masks[0]);
        self.conv1.backward(&g);
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.conv1.zero_grad();
        self.conv2.zero_grad();
        self.bn1.zero_grad();
        self.dense1.zero_grad();
        self.bn2.zero_grad();
        self.dense2.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut Param> {
        let mut params = self.conv1.parameters();
        params.extend(self.conv2.parameters());
        params.extend(self.bn1.parameters());
        params.extend(self.dense1.parameters());
        params.extend(self.bn2.parameters());
        params.extend(self.dense2.parameters());
        params
    }

    fn variables(&self, out: &mut Vec<(String, Vec<usize>)>) {
        conv_variables("e_conv_1", &self.conv1, out);
        conv_variables("e_conv_2", &self.conv2, out);
        bn_variables("e_bn_1", &self.bn1, out);
        dense_variables("e_dense_1", &self.dense1, out);
        bn_variables("e_bn_2", &self.bn2, out);
        dense_variables("e_dense_2", &self.dense2, out);
    }
}

/// Maps latent vectors back to pixel probabilities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decoder {
    dense1: LinearT,
    bn1: BatchNorm,
    dense2: LinearT,
    bn2: BatchNorm,
    tconv1: ConvTranspose2d,
    bn3: BatchNorm,
    tconv2: ConvTranspose2d,
    #[serde(skip)]
    masks: Vec<Vec<f32>>,
}

impl Decoder {
    pub fn new<R: Rng + ?Sized>(cfg: &VaeConfig, rng: &mut R) -> Self {
        let mid = 2 * cfg.min_res;
        Self {
            dense1: LinearT::new(cfg.z_dim, cfg.dense_units, rng),
            bn1: BatchNorm::dense(cfg.dense_units),
            dense2: LinearT::new(cfg.dense_units, cfg.flat_len(), rng),
            bn2: BatchNorm::dense(cfg.flat_len()),
            tconv1: ConvTranspose2d::new(cfg.min_chans, cfg.base_chans, KERNEL, STRIDE, PADDING, rng),
            bn3: BatchNorm::spatial(cfg.base_chans, mid * mid),
            tconv2: ConvTranspose2d::new(cfg.base_chans, 1, KERNEL, STRIDE, PADDING, rng),
            masks: Vec::new(),
        }
    }

    /// Inference pass; returns pixel probabilities.
    pub fn forward(&self, z: &Matrix) -> Result<Matrix> {
        let mut h = self.bn1.forward(&self.dense1.forward(z));
        relu::forward_matrix(&mut h);
        let mut h = self.bn2.forward(&self.dense2.forward(&h));
        relu::forward_matrix(&mut h);
        let mut h = self.bn3.forward(&self.tconv1.forward(&h)?);
        relu::forward_matrix(&mut h);
        let mut out = self.tconv2.forward(&h)?;
        sigmoid::forward_matrix(&mut out);
        Ok(out)
    }

    pub fn forward_train(&mut self, z: &Matrix) -> Result<Matrix> {
        self.masks.clear();
        let h = self.dense1.forward_train(z);
        let mut h = self.bn1.forward_train(&h);
        self.masks.push(relu::forward_matrix(&mut h));
        let h = self.dense2.forward_train(&h);
        let mut h = self.bn2.forward_train(&h);
        self.masks.push(relu::forward_matrix(&mut h));
        let h = self.tconv1.forward_train(&h)?;
        let mut h = self.bn3.forward_train(&h);
        self.masks.push(relu::forward_matrix(&mut h));
        let mut out = self.tconv2.forward_train(&h)?;
        sigmoid::forward_matrix(&mut out);
        Ok(out)
    }

    /// Backpropagate a gradient taken w.r.t. the pre-sigmoid logits and
    /// return the gradient for the latent input.
    pub fn backward(&mut self, grad_logits: &Matrix) -> Result<Matrix> {
        let masks = std::mem::take(&mut self.masks);
        if masks.len() != 3 {
            return Err(VaeError::NoForwardPass);
        }
        let mut g = self.tconv2.backward(grad_logits);
        relu::backward(&mut g, &masks[2]);
        let g = self.bn3.backward(&g);
        let mut g = self.tconv1.backward(&g);
        relu::backward(&mut g, &masks[1]);
        let g = self.bn2.backward(&g);
        let mut g = self.dense2.backward(&g);
        relu::backward(&mut g, &masks[0]);
        let g = self.bn1.backward(&g);
        Ok(self.dense1.backward(&g))
    }

    pub fn zero_grad(&mut self) {
        self.dense1.zero_grad();
        self.bn1.zero_grad();
        self.dense2.zero_grad();
        self.bn2.zero_grad();
        self.tconv1.zero_grad();
        self.bn3.zero_grad();
        self.tconv2.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut Param> {
        let mut params = self.dense1.parameters();
        params.extend(self.bn1.parameters());
        params.extend(self.dense2.parameters());
        params.extend(self.bn2.parameters());
        params.extend(self.tconv1.parameters());
        params.extend(self.bn3.parameters());
        params.extend(self.tconv2.parameters());
        params
    }

    fn variables(&self, out: &mut Vec<(String, Vec<usize>)>) {
        dense_variables("d_dense_1", &self.dense1, out);
        bn_variables("d_bn_1", &self.bn1, out);
        dense_variables("d_dense_2", &self.dense2, out);
        bn_variables("d_bn_2", &self.bn2, out);
        tconv_variables("d_tconv_1", &self.tconv1, out);
        bn_variables("d_bn_3", &self.bn3, out);
        tconv_variables("d_tconv_2", &self.tconv2, out);
    }
}

fn conv_variables(scope: &str, layer: &Conv2d, out: &mut Vec<(String, Vec<usize>)>) {
    let k = layer.kernel_size();
    out.push((format!("{scope}/kernel"), vec![k, k, layer.in_channels(), layer.out_channels()]));
    out.push((format!("{scope}/bias"), vec![layer.out_channels()]));
}

fn tconv_variables(scope: &str, layer: &ConvTranspose2d, out: &mut Vec<(String, Vec<usize>)>) {
    let k = layer.kernel_size();
    out.push((format!("{scope}/kernel"), vec![k, k, layer.out_channels(), layer.in_channels()]));
    out.push((format!("{scope}/bias"), vec![layer.out_channels()]));
}

fn dense_variables(scope: &str, layer: &LinearT, out: &mut Vec<(String, Vec<usize>)>) {
    out.push((format!("{scope}/kernel"), vec![layer.in_dim(), layer.out_dim()]));
    out.push((format!("{scope}/bias"), vec![layer.out_dim()]));
}

fn bn_variables(scope: &str, layer: &BatchNorm, out: &mut Vec<(String, Vec<usize>)>) {
    out.push((format!("{scope}/gamma"), vec![layer.channels()]));
    out.push((format!("{scope}/beta"), vec![layer.channels()]));
}

/// Outcome of one ELBO evaluation.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub pred: Matrix,
    pub loss: f32,
    pub ml_loss: f32,
    pub kl_loss: f32,
}

#[derive(Clone, Debug)]
struct ElboCache {
    data: Matrix,
    pred: Matrix,
    mean: Matrix,
    log_sigma: Matrix,
    eps: Matrix,
}

/// Draw `z = mean + eps * exp(log_sigma)` with `eps ~ N(0, I)`.
///
/// Returns `z` together with the noise that produced it.
pub fn sample_gaussian<R: Rng + ?Sized>(mean: &Matrix, log_sigma: &Matrix, rng: &mut R) -> (Matrix, Matrix) {
    let mut z = Matrix::zeros(mean.rows, mean.cols);
    let mut eps = Matrix::zeros(mean.rows, mean.cols);
    for i in 0..mean.data.len() {
        let e: f32 = rng.sample(StandardNormal);
        eps.data[i] = e;
        z.data[i] = mean.data[i] + e * log_sigma.data[i].exp();
    }
    (z, eps)
}

/// Convolutional variational autoencoder trained on the ELBO.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConvVae {
    config: VaeConfig,
    pub encoder: Encoder,
    pub decoder: Decoder,
    #[serde(skip, default = "rng_from_env")]
    rng: StdRng,
    #[serde(skip)]
    cache: Option<ElboCache>,
}

impl ConvVae {
    /// Build a freshly initialised model. `seed` drives both the weight
    /// initialisation and the sampling noise.
    pub fn new(config: VaeConfig, seed: Option<u64>) -> Self {
        let mut init = rng_with(seed);
        let encoder = Encoder::new(&config, &mut init);
        let decoder = Decoder::new(&config, &mut init);
        Self {
            config,
            encoder,
            decoder,
            rng: rng_with(seed),
            cache: None,
        }
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    /// Replace the sampling noise generator, e.g. after restoring. An
    /// explicit seed always yields the same noise stream.
    pub fn reseed(&mut self, seed: Option<u64>) {
        self.rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => rng_from_env(),
        };
    }

    fn check_width(expected: usize, m: &Matrix) -> Result<()> {
        if m.cols != expected {
            return Err(VaeError::Shape {
                expected,
                found: m.cols,
            });
        }
        Ok(())
    }

    /// Encode `data`, sample a latent code, decode it and score the ELBO.
    ///
    /// In training mode batch statistics are used and the activations are
    /// kept for [`ConvVae::backward`]; otherwise the running statistics are
    /// used and nothing is cached.
    pub fn evaluate(&mut self, data: &Matrix, training: bool) -> Result<Evaluation> {
        Self::check_width(self.config.image_len(), data)?;
        let (mean, log_sigma) = if training {
            self.encoder.forward_train(data)?
        } else {
            self.encoder.forward(data)?
        };
        let (z, eps) = sample_gaussian(&mean, &log_sigma, &mut self.rng);
        let pred = if training {
            self.decoder.forward_train(&z)?
        } else {
            self.decoder.forward(&z)?
        };
        let (ml_loss, _) = binary_cross_entropy(data, &pred);
        let (kl_loss, _, _) = gaussian_kl(&mean, &log_sigma);

        self.cache = if training {
            Some(ElboCache {
                data: data.clone(),
                pred: pred.clone(),
                mean,
                log_sigma,
                eps,
            })
        } else {
            None
        };
        Ok(Evaluation {
            pred,
            loss: ml_loss + kl_loss,
            ml_loss,
            kl_loss,
        })
    }

    /// Inference-mode ELBO over `data` in slices of at most `chunk` rows.
    ///
    /// The losses are the row-weighted means of the per-slice losses and
    /// the predictions are stacked in input order. Noise is drawn slice by
    /// slice in row order, so the result matches a single
    /// [`ConvVae::evaluate`] call on the whole matrix.
    pub fn evaluate_in_chunks(&mut self, data: &Matrix, chunk: usize) -> Result<Evaluation> {
        Self::check_width(self.config.image_len(), data)?;
        let chunk = chunk.max(1);
        let mut pred = Vec::with_capacity(data.data.len());
        let (mut loss, mut ml_loss, mut kl_loss) = (0.0f64, 0.0f64, 0.0f64);
        let mut start = 0;
        while start < data.rows {
            let end = (start + chunk).min(data.rows);
            let eval = self.evaluate(&data.slice_rows(start, end), false)?;
            let rows = (end - start) as f64;
            loss += eval.loss as f64 * rows;
            ml_loss += eval.ml_loss as f64 * rows;
            kl_loss += eval.kl_loss as f64 * rows;
            pred.extend_from_slice(&eval.pred.data);
            start = end;
        }
        let n = data.rows.max(1) as f64;
        Ok(Evaluation {
            pred: Matrix::from_vec(data.rows, data.cols, pred),
            loss: (loss / n) as f32,
            ml_loss: (ml_loss / n) as f32,
            kl_loss: (kl_loss / n) as f32,
        })
    }

    /// Accumulate ELBO gradients for the last training evaluation.
    pub fn backward(&mut self) -> Result<()> {
        let cache = self.cache.take().ok_or(VaeError::NoForwardPass)?;
        let (_, grad_logits) = binary_cross_entropy(&cache.data, &cache.pred);
        let grad_z = self.decoder.backward(&grad_logits)?;
        let (_, kl_mean, kl_log_sigma) = gaussian_kl(&cache.mean, &cache.log_sigma);

        let grad_mean = grad_z.add(&kl_mean);
        let mut grad_log_sigma = kl_log_sigma;
        for i in 0..grad_log_sigma.data.len() {
            let sigma = cache.log_sigma.data[i].exp();
            grad_log_sigma.data[i] += grad_z.data[i] * cache.eps.data[i] * sigma;
        }
        self.encoder.backward(&grad_mean, &grad_log_sigma)
    }

    /// Decode latent vectors in inference mode.
    pub fn decode(&self, z: &Matrix) -> Result<Matrix> {
        Self::check_width(self.config.z_dim, z)?;
        self.decoder.forward(z)
    }

    /// Standard normal latent vectors for `batch` samples.
    pub fn sample_z(&mut self, batch: usize) -> Matrix {
        let n = batch * self.config.z_dim;
        let data = (0..n).map(|_| self.rng.sample(StandardNormal)).collect();
        Matrix::from_vec(batch, self.config.z_dim, data)
    }

    pub fn zero_grad(&mut self) {
        self.encoder.zero_grad();
        self.decoder.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut Param> {
        let mut params = self.encoder.parameters();
        params.extend(self.decoder.parameters());
        params
    }

    /// Name and shape of every trainable variable.
    pub fn variables(&self) -> Vec<(String, Vec<usize>)> {
        let mut out = Vec::new();
        self.encoder.variables(&mut out);
        self.decoder.variables(&mut out);
        out
    }

    pub fn parameter_count(&self) -> usize {
        self.variables()
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny() -> VaeConfig {
        VaeConfig {
            z_dim: 2,
            min_res: 2,
            min_chans: 4,
            base_chans: 3,
            dense_units: 8,
        }
    }

    #[test]
    fn default_config_produces_mnist_sized_images() {
        assert_eq!(VaeConfig::default().image_side(), 28);
    }

    #[test]
    fn zero_log_sigma_adds_unit_noise() {
        let mut rng = StdRng::seed_from_u64(4);
        let mean = Matrix::from_vec(1, 2, vec![1.0, -1.0]);
        let (z, eps) = sample_gaussian(&mean, &Matrix::zeros(1, 2), &mut rng);
        for i in 0..2 {
            assert!((z.data[i] - mean.data[i] - eps.data[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn parameter_count_matches_parameters() {
        let mut vae = ConvVae::new(tiny(), Some(1));
        let counted: usize = vae.parameters().iter().map(|p| p.len()).sum();
        assert_eq!(vae.parameter_count(), counted);
    }

    #[test]
    fn backward_without_training_pass_fails() {
        let mut vae = ConvVae::new(tiny(), Some(1));
        let data = Matrix::zeros(2, tiny().image_len());
        vae.evaluate(&data, false).unwrap();
        assert!(matches!(vae.backward(), Err(VaeError::NoForwardPass)));
    }

    #[test]
    fn halves_refuse_backward_without_cached_pass() {
        let mut vae = ConvVae::new(tiny(), Some(1));
        let latent = Matrix::zeros(2, 2);
        assert!(matches!(
            vae.encoder.backward(&latent, &latent),
            Err(VaeError::NoForwardPass)
        ));
        assert!(matches!(
            vae.decoder.backward(&Matrix::zeros(2, 64)),
            Err(VaeError::NoForwardPass)
        ));
    }

    #[test]
    fn second_backward_needs_a_new_training_pass() {
        let mut vae = ConvVae::new(tiny(), Some(1));
        let data = Matrix::from_vec(2, 64, (0..128).map(|i| (i % 2) as f32).collect());
        vae.evaluate(&data, true).unwrap();
        vae.backward().unwrap();
        let latent = Matrix::zeros(2, 2);
        assert!(vae.encoder.backward(&latent, &latent).is_err());
        assert!(vae.decoder.backward(&Matrix::zeros(2, 64)).is_err());
    }

    #[test]
    fn chunked_inference_matches_whole_batch() {
        let mut vae = ConvVae::new(tiny(), Some(2));
        let mut rng = StdRng::seed_from_u64(6);
        let data = Matrix::from_vec(10, 64, (0..640).map(|_| rng.gen_range(0.0..1.0)).collect());
        let mut chunked = vae.clone();
        let whole = vae.evaluate(&data, false).unwrap();
        let parts = chunked.evaluate_in_chunks(&data, 3).unwrap();
        assert!((whole.loss - parts.loss).abs() < 1e-3 * whole.loss.abs().max(1.0));
        assert!((whole.ml_loss - parts.ml_loss).abs() < 1e-3 * whole.ml_loss.abs().max(1.0));
        assert!((whole.kl_loss - parts.kl_loss).abs() < 1e-3 * whole.kl_loss.abs().max(1.0));
        assert_eq!((parts.pred.rows, parts.pred.cols), (10, 64));
        for (a, b) in whole.pred.data.iter().zip(parts.pred.data.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn explicit_reseed_repeats_the_noise_stream() {
        let mut a = ConvVae::new(tiny(), Some(1));
        let mut b = a.clone();
        a.reseed(Some(9));
        b.reseed(Some(9));
        assert_eq!(a.sample_z(4), b.sample_z(4));
    }

    #[test]
    fn wrong_width_is_a_shape_error() {
        let mut vae = ConvVae::new(tiny(), Some(1));
        let err = vae.evaluate(&Matrix::zeros(1, 10), true).unwrap_err();
        assert!(matches!(err, VaeError::Shape { expected: 64, found: 10 }));
    }
}
