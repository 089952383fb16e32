use rand::Rng;
use serde::{Deserialize, Serialize};

use super::conv::{col2im, im2col, images_to_pixel_rows, pixel_rows_to_images, square_side, ConvError, Window};
use super::param::Param;
use crate::math::Matrix;

/// Transposed 2D convolution, the adjoint of [`super::Conv2d`].
///
/// Every input pixel is projected onto a `k x k` patch of each output
/// channel and overlapping patches are summed. With kernel 4, stride 2 and
/// padding 1 the output side is exactly twice the input side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConvTranspose2d {
    /// Weights of shape `(in_channels, out_channels * k * k)`.
    pub w: Param,
    pub b: Param,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    #[serde(skip)]
    last_rows: Matrix,
    #[serde(skip)]
    last_window: Option<(usize, Window)>,
}

impl ConvTranspose2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let k2 = kernel_size * kernel_size;
        Self {
            w: Param::glorot(in_channels * out_channels * k2, in_channels * k2, out_channels * k2, rng),
            b: Param::filled(out_channels, 0.0),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            last_rows: Matrix::zeros(0, 0),
            last_window: None,
        }
    }

    /// Side length of the output for an input of side `side`.
    pub fn output_side(&self, side: usize) -> Option<usize> {
        let full = side.checked_sub(1)? * self.stride + self.kernel_size;
        full.checked_sub(2 * self.padding).filter(|&s| s > 0)
    }

    fn weight(&self) -> Matrix {
        Matrix::from_vec(
            self.in_channels,
            self.out_channels * self.kernel_size * self.kernel_size,
            self.w.w.clone(),
        )
    }

    /// Window sliding over the output image whose positions are the input
    /// pixels.
    fn window(&self, x: &Matrix) -> Result<Window, ConvError> {
        let in_h = square_side(x, self.in_channels)?;
        let out_h = self.output_side(in_h).ok_or(ConvError::KernelTooLarge {
            size: in_h,
            kernel: self.kernel_size,
        })?;
        Ok(Window {
            channels: self.out_channels,
            in_h: out_h,
            in_w: out_h,
            out_h: in_h,
            out_w: in_h,
            kernel: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
        })
    }

    fn project(&self, rows: &Matrix, batch: usize, win: &Window) -> Matrix {
        let cols = Matrix::matmul(rows, &self.weight());
        let mut out = col2im(&cols, batch, win);
        let pixels = win.in_h * win.in_w;
        for r in 0..batch {
            for (c, &bias) in self.b.w.iter().enumerate() {
                let start = r * out.cols + c * pixels;
                for v in out.data[start..start + pixels].iter_mut() {
                    *v += bias;
                }
            }
        }
        out
    }

    pub fn forward(&self, x: &Matrix) -> Result<Matrix, ConvError> {
        let win = self.window(x)?;
        let rows = images_to_pixel_rows(x, self.in_channels, win.out_h * win.out_w);
        Ok(self.project(&rows, x.rows, &win))
    }

    pub fn forward_train(&mut self, x: &Matrix) -> Result<Matrix, ConvError> {
        let win = self.window(x)?;
        let rows = images_to_pixel_rows(x, self.in_channels, win.out_h * win.out_w);
        let out = self.project(&rows, x.rows, &win);
        self.last_rows = rows;
        self.last_window = Some((x.rows, win));
        Ok(out)
    }

    /// Backward pass for the last [`ConvTranspose2d::forward_train`].
    pub fn backward(&mut self, grad_out: &Matrix) -> Matrix {
        let Some((batch, win)) = self.last_window else {
            return Matrix::zeros(grad_out.rows, 0);
        };
        let pixels = win.in_h * win.in_w;
        let gb = self.b.grad_mut();
        for r in 0..grad_out.rows {
            let row = grad_out.row(r);
            for (c, g) in gb.iter_mut().enumerate() {
                *g += row[c * pixels..(c + 1) * pixels].iter().sum::<f32>();
            }
        }
        let grad_cols = im2col(grad_out, &win);
        let grad_w = Matrix::matmul(&self.last_rows.transpose(), &grad_cols);
        for (g, d) in self.w.grad_mut().iter_mut().zip(grad_w.data.iter()) {
            *g += d;
        }
        let grad_rows = Matrix::matmul(&grad_cols, &self.weight().transpose());
        pixel_rows_to_images(&grad_rows, batch, self.in_channels, win.out_h * win.out_w)
    }

    pub fn zero_grad(&mut self) {
        self.w.zero_grad();
        self.b.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.b]
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
}
