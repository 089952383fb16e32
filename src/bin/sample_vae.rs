use std::path::PathBuf;

use vanillavae::checkpoint::CheckpointManager;
use vanillavae::error::{Result, VaeError};
use vanillavae::plot::{resize_bilinear, save_gray_png};

mod common;

fn run() -> Result<()> {
    let (config, local) = common::load_config(&["count", "out"])?;
    let count = match local.get("count") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|e| VaeError::Config(format!("bad value `{v}` for `count`: {e}")))?,
        None => config.batch_size,
    };
    let out = local
        .get("out")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.plot_dir.join("samples"));

    let manager = CheckpointManager::new(&config.checkpoint_dir, config.max_to_keep);
    let mut state = manager
        .restore_latest()?
        .ok_or_else(|| VaeError::NoCheckpoint(config.checkpoint_dir.clone()))?;
    state.model.reseed(config.seed);
    let side = state.model.config().image_side();

    let z = state.model.sample_z(count);
    let pred = state.model.decode(&z)?;
    for n in 0..pred.rows {
        let img = resize_bilinear(pred.row(n), side, side, config.plot_res)?;
        save_gray_png(&out.join(format!("sample_{n}.png")), &img, config.plot_res)?;
    }
    log::info!(
        "Wrote {} samples from step {} to {}",
        pred.rows,
        state.global_step,
        out.display()
    );
    Ok(())
}

fn main() {
    common::init_logging();
    if let Err(e) = run() {
        log::error!("sampling failed: {e}");
        std::process::exit(1);
    }
}
