use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vanillavae::checkpoint::TrainingState;
use vanillavae::math::Matrix;
use vanillavae::models::{ConvVae, VaeConfig};
use vanillavae::optim::Adam;
use vanillavae::train::train_step;

fn tiny() -> VaeConfig {
    VaeConfig {
        z_dim: 2,
        min_res: 2,
        min_chans: 4,
        base_chans: 4,
        dense_units: 16,
    }
}

/// Binary images of horizontal or vertical bars.
fn bars(count: usize, rng: &mut StdRng) -> Matrix {
    let side = tiny().image_side();
    let mut data = vec![0.0; count * side * side];
    for n in 0..count {
        let line = rng.gen_range(0..side);
        let vertical = rng.gen_bool(0.5);
        for i in 0..side {
            let (r, c) = if vertical { (i, line) } else { (line, i) };
            data[n * side * side + r * side + c] = 1.0;
        }
    }
    Matrix::from_vec(count, side * side, data)
}

#[test]
fn predictions_are_probabilities() {
    let mut rng = StdRng::seed_from_u64(0);
    let mut vae = ConvVae::new(tiny(), Some(0));
    let eval = vae.evaluate(&bars(4, &mut rng), true).unwrap();
    assert_eq!((eval.pred.rows, eval.pred.cols), (4, 64));
    assert!(eval.pred.data.iter().all(|&p| p > 0.0 && p < 1.0));
    assert!((eval.loss - eval.ml_loss - eval.kl_loss).abs() < 1e-4);
    assert!(eval.kl_loss >= 0.0);
}

#[test]
fn training_reduces_the_elbo_loss() {
    let mut rng = StdRng::seed_from_u64(1);
    let data = bars(16, &mut rng);
    let mut state = TrainingState {
        global_step: 0,
        model: ConvVae::new(tiny(), Some(1)),
        optimizer: Adam::with_beta1(1e-2, 0.9),
    };
    let first = train_step(&mut state, &data, 1e-2).unwrap().loss;
    let mut last = first;
    for _ in 0..60 {
        last = train_step(&mut state, &data, 1e-2).unwrap().loss;
    }
    assert_eq!(state.global_step, 61);
    assert_eq!(state.optimizer.iterations(), 61);
    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn decode_maps_latents_to_images() {
    let mut vae = ConvVae::new(tiny(), Some(2));
    let z = vae.sample_z(3);
    assert_eq!((z.rows, z.cols), (3, 2));
    let img = vae.decode(&z).unwrap();
    assert_eq!((img.rows, img.cols), (3, 64));
    assert!(vae.decode(&Matrix::zeros(1, 5)).is_err());
}

#[test]
fn variables_follow_layer_layout() {
    let vae = ConvVae::new(tiny(), Some(3));
    let vars = vae.variables();
    assert_eq!(vars[0], ("e_conv_1/kernel".to_string(), vec![4, 4, 1, 4]));
    let last = vars.last().unwrap();
    assert_eq!(last, &("d_tconv_2/bias".to_string(), vec![1]));
    assert_eq!(vars.len(), 26);
}

#[test]
fn inference_evaluation_does_not_touch_running_statistics() {
    let mut rng = StdRng::seed_from_u64(4);
    let data = bars(4, &mut rng);
    let mut vae = ConvVae::new(tiny(), Some(4));
    let before = bincode::serialize(&vae).unwrap();
    vae.evaluate(&data, false).unwrap();
    assert_eq!(bincode::serialize(&vae).unwrap(), before);
}

fn perturbed_loss(base: &ConvVae, data: &Matrix, param: usize, idx: usize, delta: f32) -> f32 {
    let mut model = base.clone();
    model.parameters()[param].w[idx] += delta;
    model.evaluate(data, true).unwrap().loss
}

#[test]
fn elbo_gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(5);
    let data = bars(16, &mut rng);
    let base = ConvVae::new(tiny(), Some(5));

    // Clones share the noise generator state, so every evaluation below
    // draws the same eps.
    let mut analytic = base.clone();
    analytic.zero_grad();
    analytic.evaluate(&data, true).unwrap();
    analytic.backward().unwrap();
    let grads: Vec<Vec<f32>> = analytic.parameters().iter().map(|p| p.grad().to_vec()).collect();

    // (parameter, element): encoder conv1 kernel, bn1 beta, dense2 kernel,
    // the mean and log-sigma halves of the dense2 bias, then decoder bn3
    // gamma and the tconv2 kernel and bias.
    let checks = [
        (0, 3),
        (5, 1),
        (10, 6),
        (10, 7),
        (11, 0),
        (11, 1),
        (11, 2),
        (11, 3),
        (22, 0),
        (24, 5),
        (25, 0),
    ];
    let h = 2e-3;
    for (param, idx) in checks {
        let numeric = (perturbed_loss(&base, &data, param, idx, h) - perturbed_loss(&base, &data, param, idx, -h))
            / (2.0 * h);
        let exact = grads[param][idx];
        assert!(
            (numeric - exact).abs() <= 3e-2 + 0.1 * exact.abs(),
            "parameter {param}[{idx}]: numeric {numeric} vs analytic {exact}"
        );
    }
}
