use crate::checkpoint::{CheckpointManager, TrainingState};
use crate::data::BatchSource;
use crate::error::Result;
use crate::util::logging::{format_stopping_check, log_checkpoint_saved};

/// Signals returned by hooks to control the training loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackSignal {
    /// Continue training as normal.
    Continue,
    /// Stop training after the current step.
    Stop,
}

impl CallbackSignal {
    pub fn is_stop(self) -> bool {
        self == CallbackSignal::Stop
    }
}

/// Trait for hooking into the stages of a monitored session.
pub trait Hook {
    /// Called once when the session opens. Returning `Stop` ends training
    /// before the first step.
    fn begin(&mut self, _state: &mut TrainingState) -> Result<CallbackSignal> {
        Ok(CallbackSignal::Continue)
    }

    /// Called after each unit of work, once the global step has advanced.
    fn after_run(&mut self, _state: &mut TrainingState) -> Result<CallbackSignal> {
        Ok(CallbackSignal::Continue)
    }

    /// Called once when the session closes.
    fn end(&mut self, _state: &mut TrainingState) -> Result<()> {
        Ok(())
    }
}

/// Request a stop once the global step reaches `last_step`.
pub struct StopAtStep {
    last_step: u64,
}

impl StopAtStep {
    pub fn new(last_step: u64) -> Self {
        Self { last_step }
    }

    fn signal(&self, step: u64) -> CallbackSignal {
        if step >= self.last_step {
            CallbackSignal::Stop
        } else {
            CallbackSignal::Continue
        }
    }
}

impl Hook for StopAtStep {
    fn begin(&mut self, state: &mut TrainingState) -> Result<CallbackSignal> {
        Ok(self.signal(state.global_step))
    }

    fn after_run(&mut self, state: &mut TrainingState) -> Result<CallbackSignal> {
        Ok(self.signal(state.global_step))
    }
}

/// Relative-improvement rule behind [`EarlyStopping`].
///
/// A loss is checked at `step >= start_step` whenever `step` is a multiple of
/// `stopping_step`. Training stops as soon as the relative improvement over
/// the previously checked loss drops below `tolerance`.
#[derive(Clone, Debug)]
pub struct StoppingCriterion {
    start_step: u64,
    stopping_step: u64,
    tolerance: f32,
    previous_loss: Option<f32>,
}

impl StoppingCriterion {
    pub fn new(start_step: u64, stopping_step: u64, tolerance: f32) -> Self {
        Self {
            start_step,
            stopping_step: stopping_step.max(1),
            tolerance,
            previous_loss: None,
        }
    }

    pub fn previous_loss(&self) -> Option<f32> {
        self.previous_loss
    }

    pub fn is_check_step(&self, step: u64) -> bool {
        step >= self.start_step && step % self.stopping_step == 0
    }

    /// Record `loss` and report whether training should stop.
    pub fn update(&mut self, loss: f32) -> CallbackSignal {
        let signal = match self.previous_loss {
            Some(prev) if prev != 0.0 && (prev - loss) / prev < self.tolerance => CallbackSignal::Stop,
            _ => CallbackSignal::Continue,
        };
        self.previous_loss = Some(loss);
        signal
    }
}

/// Stop training when the loss on a held-out stream stops improving.
///
/// Each check scores one batch of the stream in inference mode, pushed
/// through the model `chunk_size` rows at a time.
pub struct EarlyStopping {
    criterion: StoppingCriterion,
    stream: BatchSource,
    chunk_size: usize,
}

impl EarlyStopping {
    pub fn new(criterion: StoppingCriterion, stream: BatchSource, chunk_size: usize) -> Self {
        Self {
            criterion,
            stream,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Hook for EarlyStopping {
    fn after_run(&mut self, state: &mut TrainingState) -> Result<CallbackSignal> {
        let step = state.global_step;
        if !self.criterion.is_check_step(step) {
            return Ok(CallbackSignal::Continue);
        }
        let batch = self.stream.next_batch()?;
        let loss = state.model.evaluate_in_chunks(&batch, self.chunk_size)?.loss;
        log::info!("{}", format_stopping_check(step, loss, self.criterion.previous_loss()));
        let signal = self.criterion.update(loss);
        if signal.is_stop() {
            log::info!("Early stopping triggered at step {}", step);
        }
        Ok(signal)
    }
}

/// Save checkpoints when the session opens, every `every_steps` steps and
/// when it closes.
pub struct CheckpointSaver {
    manager: CheckpointManager,
    every_steps: u64,
    last_saved: Option<u64>,
}

impl CheckpointSaver {
    pub fn new(manager: CheckpointManager, every_steps: u64) -> Self {
        Self {
            manager,
            every_steps: every_steps.max(1),
            last_saved: None,
        }
    }

    fn save(&mut self, state: &TrainingState) -> Result<()> {
        let path = self.manager.save(state)?;
        log_checkpoint_saved(state.global_step, &path.display().to_string());
        self.last_saved = Some(state.global_step);
        Ok(())
    }
}

impl Hook for CheckpointSaver {
    fn begin(&mut self, state: &mut TrainingState) -> Result<CallbackSignal> {
        self.save(state)?;
        Ok(CallbackSignal::Continue)
    }

    fn after_run(&mut self, state: &mut TrainingState) -> Result<CallbackSignal> {
        let due = match self.last_saved {
            Some(last) => state.global_step >= last + self.every_steps,
            None => true,
        };
        if due {
            self.save(state)?;
        }
        Ok(CallbackSignal::Continue)
    }

    fn end(&mut self, state: &mut TrainingState) -> Result<()> {
        if self.last_saved != Some(state.global_step) {
            self.save(state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criterion_only_checks_on_schedule() {
        let c = StoppingCriterion::new(100, 50, 1e-4);
        assert!(!c.is_check_step(50));
        assert!(c.is_check_step(100));
        assert!(!c.is_check_step(120));
        assert!(c.is_check_step(150));
    }

    #[test]
    fn first_check_never_stops() {
        let mut c = StoppingCriterion::new(0, 1, 0.5);
        assert_eq!(c.update(10.0), CallbackSignal::Continue);
        assert_eq!(c.previous_loss(), Some(10.0));
    }

    #[test]
    fn small_relative_improvement_stops() {
        let mut c = StoppingCriterion::new(0, 1, 0.1);
        c.update(10.0);
        assert_eq!(c.update(8.0), CallbackSignal::Continue);
        assert_eq!(c.update(7.9), CallbackSignal::Stop);
    }

    #[test]
    fn worse_loss_stops() {
        let mut c = StoppingCriterion::new(0, 1, 1e-4);
        c.update(5.0);
        assert_eq!(c.update(5.5), CallbackSignal::Stop);
    }

    #[test]
    fn zero_previous_loss_never_stops() {
        let mut c = StoppingCriterion::new(0, 1, 1e-4);
        assert_eq!(c.update(0.0), CallbackSignal::Continue);
        assert_eq!(c.update(5.0), CallbackSignal::Continue);
        assert_eq!(c.update(5.0), CallbackSignal::Stop);
    }

    #[test]
    fn resumed_run_starts_checking_at_start_step() {
        // A run resumed at step 120 with checks from step 100 every 50.
        let mut c = StoppingCriterion::new(100, 50, 0.1);
        let checked: Vec<u64> = (121..=260).filter(|&s| c.is_check_step(s)).collect();
        assert_eq!(checked, vec![150, 200, 250]);
        assert_eq!(c.update(10.0), CallbackSignal::Continue);
        assert_eq!(c.update(8.0), CallbackSignal::Continue);
        assert_eq!(c.update(7.5), CallbackSignal::Stop);
    }

    #[test]
    fn late_start_skips_earlier_multiples() {
        let c = StoppingCriterion::new(1000, 50, 1e-4);
        assert!((0..1000).all(|s| !c.is_check_step(s)));
        assert!(c.is_check_step(1000));
        assert!(!c.is_check_step(1025));
    }
}
