pub mod conv;
pub mod conv_transpose;
pub mod leaky_relu;
pub mod linear;
pub mod normalization;
pub mod param;
pub mod relu;
pub mod sigmoid;

pub use conv::{Conv2d, ConvError};
pub use conv_transpose::ConvTranspose2d;
pub use linear::LinearT;
pub use normalization::BatchNorm;
pub use param::Param;
