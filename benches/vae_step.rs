use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vanillavae::checkpoint::TrainingState;
use vanillavae::math::Matrix;
use vanillavae::models::{ConvVae, VaeConfig};
use vanillavae::optim::Adam;
use vanillavae::train::train_step;

fn bench_vae_step(c: &mut Criterion) {
    let config = VaeConfig {
        z_dim: 10,
        min_res: 7,
        min_chans: 32,
        base_chans: 16,
        dense_units: 256,
    };
    let batch = 16;
    let mut rng = StdRng::seed_from_u64(1);
    let data: Vec<f32> = (0..batch * config.image_len()).map(|_| rng.gen()).collect();
    let x = Matrix::from_vec(batch, config.image_len(), data);
    let mut state = TrainingState {
        global_step: 0,
        model: ConvVae::new(config, Some(1)),
        optimizer: Adam::with_beta1(1e-3, 0.9),
    };

    c.bench_function("vae_train_step", |b| {
        b.iter(|| train_step(&mut state, &x, 1e-3));
    });
}

criterion_group!(benches, bench_vae_step);
criterion_main!(benches);
