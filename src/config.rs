use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, VaeError};
use crate::models::VaeConfig;
use crate::optim::ExponentialDecay;

/// Hyperparameters and paths for a training run, loaded from a TOML or JSON
/// file. Every field has a default so a partial file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the MNIST IDX files.
    pub data_dir: PathBuf,
    /// Fetch MNIST into `data_dir` when the files are missing (requires the
    /// `download` feature).
    pub download: bool,
    /// Total number of images, used to size the final evaluation.
    pub data_count: usize,
    /// Share of the images held out for validation and early stopping.
    pub validation_fraction: f32,
    pub batch_size: usize,
    /// Batch size of the early-stopping evaluation.
    pub stopping_size: usize,
    /// Shuffle buffer size as a multiple of `batch_size`.
    pub shuffle_factor: usize,
    /// Assemble batches on a background thread.
    pub prefetch: bool,

    /// Dimension of the latent space.
    pub z_dim: usize,
    /// Spatial resolution of the smallest feature map; images are `4 * min_res`.
    pub min_res: usize,
    /// Channels of the smallest feature map.
    pub min_chans: usize,
    /// Channels of the intermediate feature map.
    pub base_chans: usize,
    /// Width of the dense hidden layers.
    pub dense_units: usize,

    pub learning_rate: f32,
    pub lr_decay_step: u64,
    pub lr_decay_rate: f32,
    pub adam_beta1: f32,

    /// Stop once the global step reaches this value.
    pub training_steps: u64,
    pub summary_step: u64,
    pub display_step: u64,
    pub plot_step: u64,
    /// Side length of saved plots.
    pub plot_res: u32,
    pub plot_dir: PathBuf,
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_step: u64,
    pub max_to_keep: usize,

    /// First step at which early stopping is checked.
    pub early_stopping_start: u64,
    /// Interval between early stopping checks.
    pub early_stopping_step: u64,
    /// Minimum relative improvement required to keep training.
    pub early_stopping_tol: f32,

    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            download: false,
            data_count: 70000,
            validation_fraction: 0.2,
            batch_size: 64,
            stopping_size: 14000,
            shuffle_factor: 5,
            prefetch: true,
            z_dim: 10,
            min_res: 7,
            min_chans: 128,
            base_chans: 64,
            dense_units: 1024,
            learning_rate: 1e-3,
            lr_decay_step: 10000,
            lr_decay_rate: 0.75,
            adam_beta1: 0.9,
            training_steps: 100000,
            summary_step: 500,
            display_step: 100,
            plot_step: 5000,
            plot_res: 80,
            plot_dir: PathBuf::from("plots"),
            log_dir: PathBuf::from("logs"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_step: 2500,
            max_to_keep: 3,
            early_stopping_start: 10000,
            early_stopping_step: 2500,
            early_stopping_tol: 1e-4,
            seed: None,
        }
    }
}

impl Config {
    /// Load configuration from the given path. Supports TOML or JSON based on
    /// the file extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        Ok(config)
    }

    /// Set one field from its command-line spelling, e.g.
    /// `apply_override("batch-size", "32")`.
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<()> {
        let key = key.trim_start_matches("--").replace('-', "_");
        let mut fields = match serde_json::to_value(&*self)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(VaeError::Config("configuration is not a table".into())),
        };
        if !fields.contains_key(&key) {
            return Err(VaeError::Config(format!("unknown option `{key}`")));
        }
        fields.insert(key.clone(), parse_scalar(value));
        *self = serde_json::from_value(serde_json::Value::Object(fields))
            .map_err(|e| VaeError::Config(format!("bad value `{value}` for `{key}`: {e}")))?;
        Ok(())
    }

    /// Reject settings the training loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size as u64),
            ("stopping_size", self.stopping_size as u64),
            ("shuffle_factor", self.shuffle_factor as u64),
            ("z_dim", self.z_dim as u64),
            ("min_res", self.min_res as u64),
            ("min_chans", self.min_chans as u64),
            ("base_chans", self.base_chans as u64),
            ("dense_units", self.dense_units as u64),
            ("lr_decay_step", self.lr_decay_step),
            ("summary_step", self.summary_step),
            ("display_step", self.display_step),
            ("plot_step", self.plot_step),
            ("plot_res", self.plot_res as u64),
            ("checkpoint_step", self.checkpoint_step),
            ("max_to_keep", self.max_to_keep as u64),
            ("early_stopping_step", self.early_stopping_step),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(VaeError::Config(format!("`{name}` must be positive")));
            }
        }
        if !(self.learning_rate > 0.0) {
            return Err(VaeError::Config("`learning_rate` must be positive".into()));
        }
        if !(self.lr_decay_rate > 0.0) {
            return Err(VaeError::Config("`lr_decay_rate` must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.adam_beta1) {
            return Err(VaeError::Config("`adam_beta1` must lie in [0, 1)".into()));
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(VaeError::Config(
                "`validation_fraction` must lie strictly between 0 and 1".into(),
            ));
        }
        Ok(())
    }

    pub fn model(&self) -> VaeConfig {
        VaeConfig {
            z_dim: self.z_dim,
            min_res: self.min_res,
            min_chans: self.min_chans,
            base_chans: self.base_chans,
            dense_units: self.dense_units,
        }
    }

    /// Continuous exponential decay from `learning_rate`.
    pub fn lr_schedule(&self) -> ExponentialDecay {
        ExponentialDecay::new(self.learning_rate, self.lr_decay_step, self.lr_decay_rate, false)
    }

    /// Shuffle buffer used by the training and validation streams.
    pub fn shuffle_buffer(&self) -> usize {
        self.batch_size * self.shuffle_factor
    }
}

fn parse_scalar(value: &str) -> serde_json::Value {
    if let Ok(v) = value.parse::<u64>() {
        return v.into();
    }
    if let Ok(v) = value.parse::<f64>() {
        return v.into();
    }
    match value {
        "true" => true.into(),
        "false" => false.into(),
        "none" | "null" => serde_json::Value::Null,
        _ => value.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn schedule_decays_from_the_learning_rate() {
        use crate::optim::LearningRateSchedule;
        let cfg = Config::default();
        let schedule = cfg.lr_schedule();
        assert_eq!(schedule.next_lr(0), cfg.learning_rate);
        let decayed = schedule.next_lr(cfg.lr_decay_step);
        assert!((decayed - cfg.learning_rate * cfg.lr_decay_rate).abs() < 1e-9);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str("batch_size = 16\nplot_dir = \"out\"").unwrap();
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.plot_dir, PathBuf::from("out"));
        assert_eq!(cfg.z_dim, Config::default().z_dim);
    }

    #[test]
    fn override_accepts_dashed_names() {
        let mut cfg = Config::default();
        cfg.apply_override("--batch-size", "32").unwrap();
        cfg.apply_override("learning_rate", "0.01").unwrap();
        cfg.apply_override("learning-rate", "1").unwrap();
        cfg.apply_override("checkpoint-dir", "ckpt").unwrap();
        cfg.apply_override("seed", "7").unwrap();
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.learning_rate, 1.0);
        assert_eq!(cfg.checkpoint_dir, PathBuf::from("ckpt"));
        assert_eq!(cfg.seed, Some(7));
    }

    #[test]
    fn override_rejects_unknown_and_ill_typed() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.apply_override("no-such-flag", "1"),
            Err(VaeError::Config(_))
        ));
        assert!(matches!(
            cfg.apply_override("batch-size", "many"),
            Err(VaeError::Config(_))
        ));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let cfg = Config {
            summary_step: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
