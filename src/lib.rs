pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod hooks;
pub mod layers;
pub mod logging;
pub mod math;
pub mod models;
pub mod optim;
pub mod plot;
pub mod rng;
pub mod session;
pub mod train;
pub mod util;
