pub mod adam;
pub mod lr_scheduler;

pub use adam::Adam;
pub use lr_scheduler::{ExponentialDecay, LearningRateSchedule};
