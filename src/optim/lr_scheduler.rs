pub trait LearningRateSchedule {
    fn next_lr(&self, step: u64) -> f32;
}

/// `base_lr * decay_rate ^ (step / decay_steps)`, with the exponent floored
/// when `staircase` is set.
pub struct ExponentialDecay {
    base_lr: f32,
    decay_steps: u64,
    decay_rate: f32,
    staircase: bool,
}

impl ExponentialDecay {
    pub fn new(base_lr: f32, decay_steps: u64, decay_rate: f32, staircase: bool) -> Self {
        Self {
            base_lr,
            decay_steps: decay_steps.max(1),
            decay_rate,
            staircase,
        }
    }
}

impl LearningRateSchedule for ExponentialDecay {
    fn next_lr(&self, step: u64) -> f32 {
        let exp = if self.staircase {
            (step / self.decay_steps) as f32
        } else {
            step as f32 / self.decay_steps as f32
        };
        self.base_lr * self.decay_rate.powf(exp)
    }
}
