use std::fs;
use std::path::PathBuf;

use uuid::Uuid;
use vanillavae::checkpoint::{load_checkpoint, save_checkpoint, CheckpointManager, TrainingState};
use vanillavae::math::Matrix;
use vanillavae::models::{ConvVae, VaeConfig};
use vanillavae::optim::Adam;
use vanillavae::train::train_step;

fn tmp_dir() -> PathBuf {
    std::env::temp_dir().join(Uuid::new_v4().to_string())
}

fn state(step: u64) -> TrainingState {
    let config = VaeConfig {
        z_dim: 2,
        min_res: 2,
        min_chans: 2,
        base_chans: 2,
        dense_units: 4,
    };
    TrainingState {
        global_step: step,
        model: ConvVae::new(config, Some(7)),
        optimizer: Adam::with_beta1(1e-3, 0.5),
    }
}

#[test]
fn checkpoint_restores_weights_moments_and_step() {
    let dir = tmp_dir();
    let mut s = state(0);
    let batch = Matrix::from_vec(2, 64, (0..128).map(|i| (i % 2) as f32).collect());
    train_step(&mut s, &batch, 1e-3).unwrap();

    let path = dir.join("single");
    save_checkpoint(&path, &s).unwrap();
    let restored = load_checkpoint(&path).unwrap();
    assert_eq!(restored.global_step, 1);
    assert_eq!(restored.optimizer.iterations(), 1);
    assert_eq!(
        bincode::serialize(&restored.model).unwrap(),
        bincode::serialize(&s.model).unwrap()
    );
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn manager_keeps_only_newest_checkpoints() {
    let dir = tmp_dir();
    let manager = CheckpointManager::new(&dir, 3);
    for step in [0, 10, 20, 30, 40] {
        manager.save(&state(step)).unwrap();
    }
    let kept: Vec<String> = manager
        .checkpoints()
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(kept, vec!["model.ckpt-20", "model.ckpt-30", "model.ckpt-40"]);
    assert!(!dir.join("model.ckpt-0").exists());
    assert!(!dir.join("model.ckpt-10").exists());
    assert_eq!(manager.latest().unwrap(), Some(dir.join("model.ckpt-40")));
    assert_eq!(manager.restore_latest().unwrap().unwrap().global_step, 40);
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn empty_directory_has_no_checkpoint() {
    let dir = tmp_dir();
    let manager = CheckpointManager::new(&dir, 3);
    assert!(manager.latest().unwrap().is_none());
    assert!(manager.restore_latest().unwrap().is_none());
}

#[test]
fn saving_the_same_step_twice_keeps_one_entry() {
    let dir = tmp_dir();
    let manager = CheckpointManager::new(&dir, 3);
    manager.save(&state(5)).unwrap();
    manager.save(&state(5)).unwrap();
    assert_eq!(manager.checkpoints().unwrap().len(), 1);
    fs::remove_dir_all(dir).unwrap();
}
