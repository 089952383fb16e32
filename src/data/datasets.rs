use crate::error::{Result, VaeError};
use crate::math::Matrix;

/// In-memory set of equally sized single-channel images with pixel values
/// in `[0, 1]`, stored back to back in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageSet {
    height: usize,
    width: usize,
    pixels: Vec<f32>,
}

impl ImageSet {
    pub fn new(height: usize, width: usize, pixels: Vec<f32>) -> Result<Self> {
        let image_len = height * width;
        if image_len == 0 || pixels.len() % image_len != 0 {
            return Err(VaeError::Dataset(format!(
                "{} pixels do not form whole {}x{} images",
                pixels.len(),
                height,
                width
            )));
        }
        Ok(Self {
            height,
            width,
            pixels,
        })
    }

    /// Build a set from raw 8-bit intensities, scaling them to `[0, 1]`.
    pub fn from_bytes(height: usize, width: usize, bytes: &[u8]) -> Result<Self> {
        let pixels = bytes.iter().map(|&p| p as f32 / 255.0).collect();
        Self::new(height, width, pixels)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of pixels in one image.
    pub fn image_len(&self) -> usize {
        self.height * self.width
    }

    pub fn len(&self) -> usize {
        self.pixels.len() / self.image_len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn image(&self, i: usize) -> &[f32] {
        let n = self.image_len();
        &self.pixels[i * n..(i + 1) * n]
    }

    /// Stack the selected images into a `(indices.len(), h * w)` matrix.
    pub fn batch(&self, indices: &[usize]) -> Matrix {
        let n = self.image_len();
        let mut data = Vec::with_capacity(indices.len() * n);
        for &i in indices {
            data.extend_from_slice(self.image(i));
        }
        Matrix::from_vec(indices.len(), n, data)
    }

    /// Append `other`'s images after this set's.
    pub fn concat(mut self, other: ImageSet) -> Result<Self> {
        if (self.height, self.width) != (other.height, other.width) {
            return Err(VaeError::Dataset(format!(
                "cannot join {}x{} images with {}x{} images",
                self.height, self.width, other.height, other.width
            )));
        }
        self.pixels.extend(other.pixels);
        Ok(self)
    }

    /// Split into `(training, validation)`, the validation part being the
    /// trailing `validation_fraction` of the images.
    pub fn split(self, validation_fraction: f32) -> (ImageSet, ImageSet) {
        let total = self.len();
        let validation = ((total as f64) * validation_fraction as f64).round() as usize;
        let training = total - validation.min(total);
        let cut = training * self.image_len();
        let mut pixels = self.pixels;
        let tail = pixels.split_off(cut);
        (
            ImageSet {
                height: self.height,
                width: self.width,
                pixels,
            },
            ImageSet {
                height: self.height,
                width: self.width,
                pixels: tail,
            },
        )
    }
}
