use rand::{rngs::StdRng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a [`StdRng`] seeded from the `SEED` environment variable.
///
/// Each call uses a unique seed derived from the base seed and an
/// incrementing counter to ensure deterministic yet distinct streams.
pub fn rng_from_env() -> StdRng {
    let base = std::env::var("SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    rng_from_seed(base)
}

/// Like [`rng_from_env`] but with an explicit base seed, falling back to the
/// environment when `seed` is `None`.
pub fn rng_with(seed: Option<u64>) -> StdRng {
    match seed {
        Some(base) => rng_from_seed(base),
        None => rng_from_env(),
    }
}

fn rng_from_seed(base: u64) -> StdRng {
    let idx = COUNTER.fetch_add(1, Ordering::SeqCst);
    StdRng::seed_from_u64(base.wrapping_add(idx))
}
