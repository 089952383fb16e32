use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::layers::ConvError;

/// Errors surfaced by training, checkpointing and data loading.
#[derive(Debug)]
pub enum VaeError {
    Io(io::Error),
    Checkpoint(bincode::Error),
    Json(serde_json::Error),
    Toml(toml::de::Error),
    Image(image::ImageError),
    Conv(ConvError),
    Config(String),
    Dataset(String),
    Shape { expected: usize, found: usize },
    NoCheckpoint(PathBuf),
    NoForwardPass,
}

pub type Result<T> = std::result::Result<T, VaeError>;

impl fmt::Display for VaeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaeError::Io(e) => write!(f, "io error: {e}"),
            VaeError::Checkpoint(e) => write!(f, "checkpoint encoding error: {e}"),
            VaeError::Json(e) => write!(f, "json error: {e}"),
            VaeError::Toml(e) => write!(f, "toml error: {e}"),
            VaeError::Image(e) => write!(f, "image error: {e}"),
            VaeError::Conv(e) => write!(f, "convolution error: {e}"),
            VaeError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            VaeError::Dataset(msg) => write!(f, "dataset error: {msg}"),
            VaeError::Shape { expected, found } => {
                write!(f, "expected {expected} features per sample, found {found}")
            }
            VaeError::NoCheckpoint(dir) => {
                write!(f, "no checkpoint found in {}", dir.display())
            }
            VaeError::NoForwardPass => {
                write!(f, "backward pass requested without a training evaluation")
            }
        }
    }
}

impl std::error::Error for VaeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VaeError::Io(e) => Some(e),
            VaeError::Checkpoint(e) => Some(e),
            VaeError::Json(e) => Some(e),
            VaeError::Toml(e) => Some(e),
            VaeError::Image(e) => Some(e),
            VaeError::Conv(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for VaeError {
    fn from(e: io::Error) -> Self {
        VaeError::Io(e)
    }
}

impl From<bincode::Error> for VaeError {
    fn from(e: bincode::Error) -> Self {
        VaeError::Checkpoint(e)
    }
}

impl From<serde_json::Error> for VaeError {
    fn from(e: serde_json::Error) -> Self {
        VaeError::Json(e)
    }
}

impl From<toml::de::Error> for VaeError {
    fn from(e: toml::de::Error) -> Self {
        VaeError::Toml(e)
    }
}

impl From<image::ImageError> for VaeError {
    fn from(e: image::ImageError) -> Self {
        VaeError::Image(e)
    }
}

impl From<ConvError> for VaeError {
    fn from(e: ConvError) -> Self {
        VaeError::Conv(e)
    }
}

impl From<csv::Error> for VaeError {
    fn from(e: csv::Error) -> Self {
        VaeError::Io(io::Error::new(io::ErrorKind::Other, e))
    }
}
