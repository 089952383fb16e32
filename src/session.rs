use crate::checkpoint::{CheckpointManager, TrainingState};
use crate::error::Result;
use crate::hooks::{CallbackSignal, Hook};

/// Drives a [`TrainingState`] through a list of [`Hook`]s.
///
/// Every call to [`MonitoredSession::run`] is followed by the `after_run`
/// hooks; once any hook asks to stop, [`MonitoredSession::should_stop`]
/// stays true for the rest of the session.
pub struct MonitoredSession {
    state: TrainingState,
    hooks: Vec<Box<dyn Hook>>,
    stop_requested: bool,
}

impl MonitoredSession {
    /// Take ownership of `state` and run every hook's `begin`.
    pub fn open(mut state: TrainingState, mut hooks: Vec<Box<dyn Hook>>) -> Result<Self> {
        let mut stop_requested = false;
        for hook in hooks.iter_mut() {
            stop_requested |= hook.begin(&mut state)?.is_stop();
        }
        Ok(Self {
            state,
            hooks,
            stop_requested,
        })
    }

    pub fn should_stop(&self) -> bool {
        self.stop_requested
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Direct access to the state outside of a monitored unit of work.
    pub fn state_mut(&mut self) -> &mut TrainingState {
        &mut self.state
    }

    /// Execute one unit of work, then the `after_run` hooks.
    pub fn run<T, F>(&mut self, work: F) -> Result<T>
    where
        F: FnOnce(&mut TrainingState) -> Result<T>,
    {
        let out = work(&mut self.state)?;
        for hook in self.hooks.iter_mut() {
            if hook.after_run(&mut self.state)? == CallbackSignal::Stop {
                self.stop_requested = true;
            }
        }
        Ok(out)
    }

    /// Run every hook's `end` and hand the state back.
    pub fn close(mut self) -> Result<TrainingState> {
        for hook in self.hooks.iter_mut() {
            hook.end(&mut self.state)?;
        }
        Ok(self.state)
    }
}

/// Resume from the newest checkpoint in `manager`, or build a fresh state.
///
/// A resumed model draws its sampling noise from `seed`, the same seed a
/// fresh state would be built with.
pub fn restore_or_init<F>(manager: &CheckpointManager, seed: Option<u64>, init: F) -> Result<TrainingState>
where
    F: FnOnce() -> TrainingState,
{
    match manager.restore_latest()? {
        Some(mut state) => {
            state.model.reseed(seed);
            log::info!("Resuming from step {}", state.global_step);
            Ok(state)
        }
        None => {
            log::info!("No checkpoint in {}, starting fresh", manager.dir().display());
            Ok(init())
        }
    }
}
