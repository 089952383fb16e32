pub mod vae;

pub use vae::{sample_gaussian, ConvVae, Decoder, Encoder, Evaluation, VaeConfig};
