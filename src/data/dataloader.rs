use rand::rngs::StdRng;
use rand::Rng;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use super::datasets::ImageSet;
use crate::error::{Result, VaeError};
use crate::math::Matrix;

/// Endless stream of shuffled, fixed-size batches over an [`ImageSet`].
///
/// The set is shuffled once per pass and passes repeat forever. Within a
/// pass, indices flow in order into a shuffle buffer of `buffer_size`
/// entries and each sample is drawn uniformly from the buffer, which is then
/// refilled from the same pass. A new pass starts only once the buffer and
/// the current pass are both used up, so every run of `len` consecutive
/// draws from a pass boundary is a permutation of the set. Every batch holds
/// exactly `batch_size` images, so batches freely straddle pass boundaries.
pub struct DataLoader {
    images: Arc<ImageSet>,
    batch_size: usize,
    buffer_size: usize,
    buffer: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(images: Arc<ImageSet>, batch_size: usize, buffer_size: usize, rng: StdRng) -> Result<Self> {
        if images.is_empty() {
            return Err(VaeError::Dataset("cannot stream batches from an empty image set".into()));
        }
        if batch_size == 0 {
            return Err(VaeError::Config("batch size must be positive".into()));
        }
        let buffer_size = buffer_size.clamp(1, images.len());
        Ok(Self {
            images,
            batch_size,
            buffer_size,
            buffer: Vec::with_capacity(buffer_size),
            cursor: 0,
            rng,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn images(&self) -> &ImageSet {
        &self.images
    }

    fn next_index(&mut self) -> usize {
        let len = self.images.len();
        if self.buffer.is_empty() && self.cursor == len {
            self.cursor = 0;
        }
        while self.buffer.len() < self.buffer_size && self.cursor < len {
            self.buffer.push(self.cursor);
            self.cursor += 1;
        }
        let pick = self.rng.gen_range(0..self.buffer.len());
        self.buffer.swap_remove(pick)
    }

    pub fn next_indices(&mut self) -> Vec<usize> {
        (0..self.batch_size).map(|_| self.next_index()).collect()
    }

    pub fn next_batch(&mut self) -> Matrix {
        let indices = self.next_indices();
        self.images.batch(&indices)
    }
}

impl Iterator for DataLoader {
    type Item = Matrix;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// Runs a [`DataLoader`] on a background thread, keeping up to `depth`
/// batches ready. The worker exits once the `Prefetch` is dropped.
pub struct Prefetch {
    rx: Receiver<Matrix>,
}

impl Prefetch {
    pub fn spawn(mut loader: DataLoader, depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        thread::spawn(move || {
            while tx.send(loader.next_batch()).is_ok() {}
        });
        Self { rx }
    }

    pub fn next_batch(&mut self) -> Result<Matrix> {
        self.rx
            .recv()
            .map_err(|_| VaeError::Dataset("prefetch worker stopped".into()))
    }
}

/// A batch stream that is either assembled inline or prefetched.
pub enum BatchSource {
    Direct(DataLoader),
    Prefetched(Prefetch),
}

impl BatchSource {
    pub fn new(loader: DataLoader, prefetch: Option<usize>) -> Self {
        match prefetch {
            Some(depth) => BatchSource::Prefetched(Prefetch::spawn(loader, depth)),
            None => BatchSource::Direct(loader),
        }
    }

    pub fn next_batch(&mut self) -> Result<Matrix> {
        match self {
            BatchSource::Direct(loader) => Ok(loader.next_batch()),
            BatchSource::Prefetched(p) => p.next_batch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn set(count: usize) -> Arc<ImageSet> {
        Arc::new(ImageSet::new(1, 1, (0..count).map(|v| v as f32).collect()).unwrap())
    }

    #[test]
    fn batches_are_always_full() {
        let mut loader = DataLoader::new(set(5), 3, 2, StdRng::seed_from_u64(0)).unwrap();
        for _ in 0..10 {
            let b = loader.next_batch();
            assert_eq!((b.rows, b.cols), (3, 1));
        }
    }

    fn sorted(mut v: Vec<usize>) -> Vec<usize> {
        v.sort_unstable();
        v
    }

    #[test]
    fn every_pass_is_a_permutation() {
        let all: Vec<usize> = (0..100).collect();
        for seed in 0..5 {
            for buffer in [100, 10, 7, 1] {
                let mut loader = DataLoader::new(set(100), 100, buffer, StdRng::seed_from_u64(seed)).unwrap();
                for pass in 0..3 {
                    assert_eq!(
                        sorted(loader.next_indices()),
                        all,
                        "seed {seed}, buffer {buffer}, pass {pass}"
                    );
                }
            }
        }
    }

    #[test]
    fn passes_hold_across_straddling_batches() {
        let all: Vec<usize> = (0..100).collect();
        for seed in 0..5 {
            let mut loader = DataLoader::new(set(100), 30, 10, StdRng::seed_from_u64(seed)).unwrap();
            let draws: Vec<usize> = (0..10).flat_map(|_| loader.next_indices()).collect();
            for pass in draws.chunks(100) {
                assert_eq!(sorted(pass.to_vec()), all, "seed {seed}");
            }
        }
    }

    #[test]
    fn full_buffer_shuffles_each_pass_differently() {
        let mut loader = DataLoader::new(set(100), 100, 100, StdRng::seed_from_u64(3)).unwrap();
        let first = loader.next_indices();
        let second = loader.next_indices();
        assert_ne!(first, second);
        assert_ne!(first, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn unit_buffer_preserves_order() {
        let mut loader = DataLoader::new(set(4), 3, 1, StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(loader.next_indices(), vec![0, 1, 2]);
        assert_eq!(loader.next_indices(), vec![3, 0, 1]);
    }

    #[test]
    fn empty_set_is_rejected() {
        let empty = Arc::new(ImageSet::new(1, 1, Vec::new()).unwrap());
        assert!(DataLoader::new(empty, 1, 1, StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn prefetched_batches_match_shape() {
        let loader = DataLoader::new(set(4), 2, 4, StdRng::seed_from_u64(0)).unwrap();
        let mut source = BatchSource::new(loader, Some(2));
        for _ in 0..5 {
            assert_eq!(source.next_batch().unwrap().rows, 2);
        }
    }
}
