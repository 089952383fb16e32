pub mod dataloader;
pub mod datasets;

pub use dataloader::{BatchSource, DataLoader, Prefetch};
pub use datasets::ImageSet;

use mnist::MnistBuilder;
use std::path::Path;

use crate::error::{Result, VaeError};

/// Side length of MNIST digits.
pub const MNIST_SIDE: usize = 28;

const MNIST_FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

/// Loader for the full MNIST dataset (training and test images together).
pub struct Mnist;

impl Mnist {
    /// Read all 70000 MNIST digits from `data_dir`.
    ///
    /// The labels are ignored. When `download` is set and the crate was built
    /// with the `download` feature, missing files are fetched first.
    pub fn load(data_dir: &Path, download: bool) -> Result<ImageSet> {
        let missing: Vec<&str> = MNIST_FILES
            .iter()
            .copied()
            .filter(|f| !data_dir.join(f).is_file())
            .collect();
        if !missing.is_empty() {
            if download {
                download_mnist(data_dir)?;
            } else {
                return Err(VaeError::Dataset(format!(
                    "missing MNIST files in {}: {}",
                    data_dir.display(),
                    missing.join(", ")
                )));
            }
        }

        let base = format!("{}/", data_dir.display());
        let mnist = MnistBuilder::new()
            .base_path(&base)
            .label_format_digit()
            .finalize();
        log::info!(
            "Loaded {} training and {} test digits from {}",
            mnist.trn_img.len() / (MNIST_SIDE * MNIST_SIDE),
            mnist.tst_img.len() / (MNIST_SIDE * MNIST_SIDE),
            data_dir.display()
        );
        let train = ImageSet::from_bytes(MNIST_SIDE, MNIST_SIDE, &mnist.trn_img)?;
        let test = ImageSet::from_bytes(MNIST_SIDE, MNIST_SIDE, &mnist.tst_img)?;
        train.concat(test)
    }
}

/// Download the MNIST dataset into `data_dir`.
///
/// This uses the `mnist` crate's built-in downloader which fetches the
/// required archive files and extracts them so that a file like
/// `data/train-images-idx3-ubyte` is available.
#[cfg(feature = "download")]
pub fn download_mnist(data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let base = format!("{}/", data_dir.display());
    log::info!("Downloading MNIST into {}", data_dir.display());
    // `finalize` triggers the download when `download_and_extract` is
    // enabled; only the files on disk matter here.
    let _ = MnistBuilder::new()
        .base_path(&base)
        .download_and_extract()
        .finalize();
    Ok(())
}

#[cfg(not(feature = "download"))]
pub fn download_mnist(data_dir: &Path) -> Result<()> {
    Err(VaeError::Dataset(format!(
        "MNIST is missing from {} and this build lacks the `download` feature",
        data_dir.display()
    )))
}
