use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::linear::LinearT;
use super::param::Param;
use crate::math::Matrix;

/// Sliding-window geometry shared by the convolution and its transpose.
///
/// `in_*` is the image the window slides over, `out_*` the grid of window
/// positions. Images are laid out channel-major inside each batch row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Window {
    pub channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Window {
    fn patch_len(&self) -> usize {
        self.channels * self.kernel * self.kernel
    }

    /// Flat index into an image row for window position `(oh, ow)` and
    /// kernel offset `(ic, kh, kw)`, or `None` when it lands in the padding.
    fn source(&self, oh: usize, ow: usize, ic: usize, kh: usize, kw: usize) -> Option<usize> {
        let ih = (oh * self.stride + kh) as isize - self.padding as isize;
        let iw = (ow * self.stride + kw) as isize - self.padding as isize;
        if ih < 0 || iw < 0 || ih >= self.in_h as isize || iw >= self.in_w as isize {
            return None;
        }
        Some(ic * self.in_h * self.in_w + ih as usize * self.in_w + iw as usize)
    }
}

/// Unfold every window position of every image into a row.
pub(crate) fn im2col(x: &Matrix, win: &Window) -> Matrix {
    let batch = x.rows;
    let mut cols = Matrix::zeros(batch * win.out_h * win.out_w, win.patch_len());
    let mut row = 0;
    for b in 0..batch {
        let img = x.row(b);
        for oh in 0..win.out_h {
            for ow in 0..win.out_w {
                let mut col_idx = 0;
                for ic in 0..win.channels {
                    for kh in 0..win.kernel {
                        for kw in 0..win.kernel {
                            if let Some(idx) = win.source(oh, ow, ic, kh, kw) {
                                cols.set(row, col_idx, img[idx]);
                            }
                            col_idx += 1;
                        }
                    }
                }
                row += 1;
            }
        }
    }
    cols
}

/// Fold unfolded rows back onto images, summing overlapping contributions.
pub(crate) fn col2im(cols: &Matrix, batch: usize, win: &Window) -> Matrix {
    let mut img = Matrix::zeros(batch, win.channels * win.in_h * win.in_w);
    let img_cols = img.cols;
    let mut row = 0;
    for b in 0..batch {
        for oh in 0..win.out_h {
            for ow in 0..win.out_w {
                let mut col_idx = 0;
                for ic in 0..win.channels {
                    for kh in 0..win.kernel {
                        for kw in 0..win.kernel {
                            if let Some(idx) = win.source(oh, ow, ic, kh, kw) {
                                img.data[b * img_cols + idx] += cols.get(row, col_idx);
                            }
                            col_idx += 1;
                        }
                    }
                }
                row += 1;
            }
        }
    }
    img
}

/// `(batch, channels * pixels)` images to `(batch * pixels, channels)` rows.
pub(crate) fn images_to_pixel_rows(x: &Matrix, channels: usize, pixels: usize) -> Matrix {
    let mut out = Matrix::zeros(x.rows * pixels, channels);
    for b in 0..x.rows {
        let img = x.row(b);
        for p in 0..pixels {
            for c in 0..channels {
                out.set(b * pixels + p, c, img[c * pixels + p]);
            }
        }
    }
    out
}

/// Inverse of [`images_to_pixel_rows`].
pub(crate) fn pixel_rows_to_images(rows: &Matrix, batch: usize, channels: usize, pixels: usize) -> Matrix {
    let mut out = Matrix::zeros(batch, channels * pixels);
    for b in 0..batch {
        for p in 0..pixels {
            for c in 0..channels {
                out.set(b, c * pixels + p, rows.get(b * pixels + p, c));
            }
        }
    }
    out
}

/// Side length of the square images held in `x`, checked against the
/// expected channel count.
pub(crate) fn square_side(x: &Matrix, channels: usize) -> Result<usize, ConvError> {
    if channels == 0 || x.cols % channels != 0 {
        return Err(ConvError::ChannelMismatch {
            features: x.cols,
            in_channels: channels,
        });
    }
    let hw = x.cols / channels;
    let side = (hw as f64).sqrt().round() as usize;
    if side * side != hw {
        return Err(ConvError::NonSquareInput { size: hw });
    }
    Ok(side)
}

#[derive(Debug, PartialEq)]
pub enum ConvError {
    ChannelMismatch { features: usize, in_channels: usize },
    NonSquareInput { size: usize },
    KernelTooLarge { size: usize, kernel: usize },
}

impl fmt::Display for ConvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvError::ChannelMismatch {
                features,
                in_channels,
            } => write!(
                f,
                "Input feature count {} is not divisible by in_channels {}",
                features, in_channels
            ),
            ConvError::NonSquareInput { size } => {
                write!(f, "Input spatial size {} is not a perfect square", size)
            }
            ConvError::KernelTooLarge { size, kernel } => write!(
                f,
                "Kernel {} does not fit padded input of side {}",
                kernel, size
            ),
        }
    }
}

impl std::error::Error for ConvError {}

/// 2D convolution layer using im2col and a dense weight matrix.
///
/// Each input row holds one square image of shape
/// `in_channels x side x side`. The kernel weights and per-channel bias live
/// in a [`LinearT`] of shape `(in_channels * k * k, out_channels)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conv2d {
    pub w: LinearT,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    #[serde(skip)]
    last_window: Option<(usize, Window)>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let w = LinearT::new(in_channels * kernel_size * kernel_size, out_channels, rng);
        Self {
            w,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            last_window: None,
        }
    }

    /// Side length of the output for an input of side `side`.
    pub fn output_side(&self, side: usize) -> Option<usize> {
        let padded = side + 2 * self.padding;
        if padded < self.kernel_size {
            return None;
        }
        Some((padded - self.kernel_size) / self.stride + 1)
    }

    fn window(&self, x: &Matrix) -> Result<Window, ConvError> {
        let in_h = square_side(x, self.in_channels)?;
        let out_h = self.output_side(in_h).ok_or(ConvError::KernelTooLarge {
            size: in_h,
            kernel: self.kernel_size,
        })?;
        Ok(Window {
            channels: self.in_channels,
            in_h,
            in_w: in_h,
            out_h,
            out_w: out_h,
            kernel: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
        })
    }

    pub fn forward(&self, x: &Matrix) -> Result<Matrix, ConvError> {
        let win = self.window(x)?;
        let out_cols = self.w.forward(&im2col(x, &win));
        Ok(pixel_rows_to_images(
            &out_cols,
            x.rows,
            self.out_channels,
            win.out_h * win.out_w,
        ))
    }

    pub fn forward_train(&mut self, x: &Matrix) -> Result<Matrix, ConvError> {
        let win = self.window(x)?;
        let out_cols = self.w.forward_train(&im2col(x, &win));
        self.last_window = Some((x.rows, win));
        Ok(pixel_rows_to_images(
            &out_cols,
            x.rows,
            self.out_channels,
            win.out_h * win.out_w,
        ))
    }

    /// Backward pass for the last [`Conv2d::forward_train`]; returns the
    /// gradient with respect to that input.
    pub fn backward(&mut self, grad_out: &Matrix) -> Matrix {
        let Some((batch, win)) = self.last_window else {
            return Matrix::zeros(grad_out.rows, 0);
        };
        let grad_cols = images_to_pixel_rows(grad_out, self.out_channels, win.out_h * win.out_w);
        let grad_in_cols = self.w.backward(&grad_cols);
        col2im(&grad_in_cols, batch, &win)
    }

    pub fn zero_grad(&mut self) {
        self.w.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut Param> {
        self.w.parameters()
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> usize {
        self.padding
    }
}
