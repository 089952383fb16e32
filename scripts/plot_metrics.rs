use std::env;
use std::path::PathBuf;

use vanillavae::logging::read_metrics;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs/training/metrics.jsonl"));
    let records = read_metrics(&path)?;
    if records.is_empty() {
        log::warn!("no records in {}", path.display());
        return Ok(());
    }
    let max_loss = records.iter().fold(f32::MIN, |a, r| a.max(r.loss));
    for rec in &records {
        let bar = if max_loss > 0.0 {
            ((rec.loss / max_loss) * 50.0).max(0.0) as usize
        } else {
            0
        };
        println!("{:7} | {:10.4} | {}", rec.step, rec.loss, "*".repeat(bar));
    }
    Ok(())
}
