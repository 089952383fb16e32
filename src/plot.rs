use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use std::path::Path;

use crate::error::{Result, VaeError};

/// Bilinearly resize a single-channel `height x width` image of `[0, 1]`
/// intensities to `res x res`.
pub fn resize_bilinear(pixels: &[f32], height: usize, width: usize, res: u32) -> Result<Vec<f32>> {
    let img: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(width as u32, height as u32, pixels.to_vec()).ok_or(VaeError::Shape {
            expected: height * width,
            found: pixels.len(),
        })?;
    Ok(imageops::resize(&img, res, res, FilterType::Triangle).into_raw())
}

/// Stretch one image to the full 0..=255 range. Constant images map to
/// black.
pub fn to_gray_u8(pixels: &[f32]) -> Vec<u8> {
    let (lo, hi) = pixels
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = hi - lo;
    pixels
        .iter()
        .map(|&v| {
            if range > 0.0 {
                ((v - lo) / range * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect()
}

/// Write a square grayscale image of side `side` as PNG.
pub fn save_gray_png(path: &Path, pixels: &[f32], side: u32) -> Result<()> {
    let img = GrayImage::from_raw(side, side, to_gray_u8(pixels)).ok_or(VaeError::Shape {
        expected: (side * side) as usize,
        found: pixels.len(),
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path)?;
    Ok(())
}
