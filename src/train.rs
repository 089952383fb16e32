use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

use crate::checkpoint::{CheckpointManager, TrainingState};
use crate::config::Config;
use crate::data::{BatchSource, DataLoader, ImageSet, Mnist};
use crate::error::{Result, VaeError};
use crate::hooks::{CheckpointSaver, EarlyStopping, Hook, StopAtStep, StoppingCriterion};
use crate::logging::{Logger, MetricRecord};
use crate::math::Matrix;
use crate::models::{ConvVae, Evaluation};
use crate::optim::{Adam, LearningRateSchedule};
use crate::plot::{resize_bilinear, save_gray_png};
use crate::rng::rng_with;
use crate::session::MonitoredSession;
use crate::util::logging::{log_step_report, log_variables};

/// Shares of `data_count` used to size the final evaluation.
const TRAINING_SHARE: f64 = 0.8;
const VALIDATION_SHARE: f64 = 0.2;

/// One optimisation step: ELBO forward and backward on `batch`, an Adam
/// update at learning rate `lr`, and a global step increment.
pub fn train_step(state: &mut TrainingState, batch: &Matrix, lr: f32) -> Result<Evaluation> {
    state.model.zero_grad();
    let eval = state.model.evaluate(batch, true)?;
    state.model.backward()?;
    state.optimizer.lr = lr;
    state.optimizer.step(&mut state.model.parameters());
    state.global_step += 1;
    Ok(eval)
}

fn record(step: u64, eval: &Evaluation, learning_rate: f32) -> MetricRecord {
    MetricRecord {
        step,
        loss: eval.loss,
        kl_loss: eval.kl_loss,
        ml_loss: eval.ml_loss,
        learning_rate,
    }
}

/// Training script for [`ConvVae`]: owns the data streams, the learning
/// rate schedule and the summary writers.
pub struct Trainer {
    config: Config,
    training_set: Arc<ImageSet>,
    validation_set: Arc<ImageSet>,
    schedule: Box<dyn LearningRateSchedule + Send>,
    train_stream: BatchSource,
    valid_stream: BatchSource,
    train_log: Logger,
    valid_log: Logger,
}

impl Trainer {
    pub fn new(config: Config, training_set: ImageSet, validation_set: ImageSet) -> Result<Self> {
        config.validate()?;
        let side = config.model().image_side();
        for set in [&training_set, &validation_set] {
            if set.height() != side || set.width() != side {
                return Err(VaeError::Config(format!(
                    "model expects {side}x{side} images, dataset holds {}x{}",
                    set.height(),
                    set.width()
                )));
            }
        }
        let training_set = Arc::new(training_set);
        let validation_set = Arc::new(validation_set);
        let train_stream = Self::stream(&config, &training_set, config.batch_size, config.shuffle_buffer())?;
        let valid_stream = Self::stream(&config, &validation_set, config.batch_size, config.shuffle_buffer())?;
        let schedule: Box<dyn LearningRateSchedule + Send> = Box::new(config.lr_schedule());
        let train_log = Logger::new(&config.log_dir.join("training"))?;
        let valid_log = Logger::new(&config.log_dir.join("validation"))?;
        Ok(Self {
            config,
            training_set,
            validation_set,
            schedule,
            train_stream,
            valid_stream,
            train_log,
            valid_log,
        })
    }

    /// Load MNIST from `config.data_dir` and split off the validation share.
    pub fn from_config(config: Config) -> Result<Self> {
        let images = Mnist::load(&config.data_dir, config.download)?;
        if images.len() != config.data_count {
            log::warn!(
                "Loaded {} images but data_count is {}",
                images.len(),
                config.data_count
            );
        }
        let (training, validation) = images.split(config.validation_fraction);
        log::info!(
            "Using {} training and {} validation images",
            training.len(),
            validation.len()
        );
        Self::new(config, training, validation)
    }

    fn stream(config: &Config, set: &Arc<ImageSet>, batch_size: usize, buffer: usize) -> Result<BatchSource> {
        let loader = DataLoader::new(Arc::clone(set), batch_size, buffer, rng_with(config.seed))?;
        let depth = config.prefetch.then_some(config.shuffle_factor);
        Ok(BatchSource::new(loader, depth))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::new(&self.config.checkpoint_dir, self.config.max_to_keep)
    }

    /// Fresh model and optimizer at step 0.
    pub fn initial_state(&self) -> TrainingState {
        TrainingState {
            global_step: 0,
            model: ConvVae::new(self.config.model(), self.config.seed),
            optimizer: Adam::with_beta1(self.config.learning_rate, self.config.adam_beta1),
        }
    }

    /// Stop-at-step, early stopping and checkpoint saving, in that order.
    pub fn hooks(&self, manager: CheckpointManager) -> Result<Vec<Box<dyn Hook>>> {
        let c = &self.config;
        let loader = DataLoader::new(
            Arc::clone(&self.validation_set),
            c.stopping_size,
            c.stopping_size,
            rng_with(c.seed),
        )?;
        let stopping_stream = BatchSource::new(loader, c.prefetch.then_some(1));
        let criterion = StoppingCriterion::new(
            c.early_stopping_start,
            c.early_stopping_step,
            c.early_stopping_tol,
        );
        Ok(vec![
            Box::new(StopAtStep::new(c.training_steps)),
            Box::new(EarlyStopping::new(criterion, stopping_stream, c.batch_size)),
            Box::new(CheckpointSaver::new(manager, c.checkpoint_step)),
        ])
    }

    /// Run optimisation steps until a hook requests a stop.
    pub fn train(&mut self, session: &mut MonitoredSession) -> Result<()> {
        log_variables(&session.state().model.variables());
        log::info!("Initializing variables");
        while !session.should_stop() {
            let step = session.state().global_step;
            let batch = self.train_stream.next_batch()?;
            let lr = self.schedule.next_lr(step);
            let eval = session.run(|state| train_step(state, &batch, lr))?;

            if step % self.config.summary_step == 0 {
                self.train_log.log(&record(step, &eval, lr))?;
            }
            if step % self.config.display_step == 0 {
                log_step_report(step, eval.kl_loss, eval.ml_loss, eval.loss);
            }
            if step % self.config.plot_step == 0 {
                let label = step.to_string();
                self.plot_predictions(&mut session.state_mut().model, &label)?;
                self.plot_comparisons(&mut session.state_mut().model, &label)?;
            }

            if session.should_stop() {
                break;
            }

            if step % self.config.summary_step == 0 {
                let vbatch = self.valid_stream.next_batch()?;
                let veval = session.state_mut().model.evaluate(&vbatch, false)?;
                self.valid_log.log(&record(step, &veval, lr))?;
            }
        }
        Ok(())
    }

    fn resize_rows(&self, m: &Matrix) -> Result<Vec<Vec<f32>>> {
        let side = self.config.model().image_side();
        (0..m.rows)
            .map(|r| resize_bilinear(m.row(r), side, side, self.config.plot_res))
            .collect()
    }

    /// Decode `batch_size` random latent vectors, resized to `plot_res`.
    pub fn predict_samples(&mut self, model: &mut ConvVae) -> Result<Vec<Vec<f32>>> {
        let z = model.sample_z(self.config.batch_size);
        let pred = model.decode(&z)?;
        self.resize_rows(&pred)
    }

    /// A validation batch and its reconstruction, both resized.
    pub fn predict_reconstructions(&mut self, model: &mut ConvVae) -> Result<(Vec<Vec<f32>>, Vec<Vec<f32>>)> {
        let batch = self.valid_stream.next_batch()?;
        let eval = model.evaluate(&batch, false)?;
        Ok((self.resize_rows(&batch)?, self.resize_rows(&eval.pred)?))
    }

    fn plot_subdir(&self, label: &str) -> PathBuf {
        self.config.plot_dir.join(label)
    }

    pub fn plot_predictions(&mut self, model: &mut ConvVae, label: &str) -> Result<()> {
        let dir = self.plot_subdir(label);
        let res = self.config.plot_res;
        for (n, img) in self.predict_samples(model)?.iter().enumerate() {
            save_gray_png(&dir.join(format!("plot_{n}.png")), img, res)?;
        }
        Ok(())
    }

    pub fn plot_comparisons(&mut self, model: &mut ConvVae, label: &str) -> Result<()> {
        let dir = self.plot_subdir(label);
        let res = self.config.plot_res;
        let (data, pred) = self.predict_reconstructions(model)?;
        for (n, (d, p)) in data.iter().zip(pred.iter()).enumerate() {
            save_gray_png(&dir.join(format!("data_{n}.png")), d, res)?;
            save_gray_png(&dir.join(format!("pred_{n}.png")), p, res)?;
        }
        Ok(())
    }

    /// Sum the inference-mode loss over `batches` batches of `stream`.
    pub fn compute_cumulative_loss(model: &mut ConvVae, stream: &mut BatchSource, batches: usize) -> Result<f32> {
        let pb = ProgressBar::new(batches as u64);
        pb.set_style(
            ProgressStyle::with_template("Batch {pos} of {len} {wide_bar}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        let mut total = 0.0;
        for _ in 0..batches {
            let batch = stream.next_batch()?;
            total += model.evaluate(&batch, false)?.loss;
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(total)
    }

    /// Mean training and validation loss over the share of `data_count`
    /// that fits into whole batches.
    pub fn evaluate(&mut self, model: &mut ConvVae) -> Result<(f32, f32)> {
        let per_batch = self.config.data_count as f64 / self.config.batch_size as f64;
        let t_batches = (TRAINING_SHARE * per_batch).floor() as usize;
        let v_batches = (VALIDATION_SHARE * per_batch).floor() as usize;

        log::info!("Training dataset:");
        let t_total = Self::compute_cumulative_loss(model, &mut self.train_stream, t_batches)?;
        log::info!("Validation dataset:");
        let v_total = Self::compute_cumulative_loss(model, &mut self.valid_stream, v_batches)?;

        let mean = |total: f32, n: usize| if n == 0 { 0.0 } else { total / n as f32 };
        Ok((mean(t_total, t_batches), mean(v_total, v_batches)))
    }

    /// Restart the training and validation streams from a fresh shuffle.
    pub fn reinitialize_streams(&mut self) -> Result<()> {
        let (batch, buffer) = (self.config.batch_size, self.config.shuffle_buffer());
        self.train_stream = Self::stream(&self.config, &self.training_set, batch, buffer)?;
        self.valid_stream = Self::stream(&self.config, &self.validation_set, batch, buffer)?;
        Ok(())
    }
}
