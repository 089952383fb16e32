use vanillavae::error::{Result, VaeError};
use vanillavae::session::{restore_or_init, MonitoredSession};
use vanillavae::train::Trainer;

mod common;

fn run() -> Result<()> {
    let (config, _) = common::load_config(&[])?;
    let mut trainer = Trainer::from_config(config)?;

    let manager = trainer.checkpoint_manager();
    let state = restore_or_init(&manager, trainer.config().seed, || trainer.initial_state())?;
    let hooks = trainer.hooks(manager.clone())?;
    let mut session = MonitoredSession::open(state, hooks)?;
    trainer.train(&mut session)?;
    session.close()?;

    log::info!("[ TRAINING COMPLETE ]");

    let mut state = manager
        .restore_latest()?
        .ok_or_else(|| VaeError::NoCheckpoint(manager.dir().to_path_buf()))?;
    state.model.reseed(trainer.config().seed);
    trainer.plot_predictions(&mut state.model, "final")?;
    trainer.reinitialize_streams()?;

    log::info!("[ Evaluating Model ]");
    let (t_loss, v_loss) = trainer.evaluate(&mut state.model)?;
    log::info!("[ Final Evaluations ]");
    log::info!("Training loss: {:.5}", t_loss);
    log::info!("Validation loss: {:.5}", v_loss);
    Ok(())
}

fn main() {
    common::init_logging();
    if let Err(e) = run() {
        log::error!("training failed: {e}");
        std::process::exit(1);
    }
}
