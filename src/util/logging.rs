/// Format the periodic training progress line.
pub fn format_step_report(step: u64, kl_loss: f32, ml_loss: f32, loss: f32) -> String {
    format!(
        "Step {}:  {:.10} [kl_loss]   {:.10} [ml_loss]   {:.10} [loss]",
        step, kl_loss, ml_loss, loss
    )
}

pub fn log_step_report(step: u64, kl_loss: f32, ml_loss: f32, loss: f32) {
    log::info!("{}", format_step_report(step, kl_loss, ml_loss, loss));
}

/// Format a checkpoint saved message.
pub fn format_checkpoint_saved(step: u64, path: &str) -> String {
    format!("Checkpoint for step {} saved to {}", step, path)
}

pub fn log_checkpoint_saved(step: u64, path: &str) {
    log::info!("{}", format_checkpoint_saved(step, path));
}

/// Format the result of one early-stopping check.
pub fn format_stopping_check(step: u64, loss: f32, previous: Option<f32>) -> String {
    match previous {
        Some(prev) => format!(
            "Early stopping check at step {}: loss {:.6} (previous {:.6})",
            step, loss, prev
        ),
        None => format!("Early stopping check at step {}: loss {:.6}", step, loss),
    }
}

/// Render the trainable variables as a table followed by the total count.
pub fn format_variables(vars: &[(String, Vec<usize>)]) -> String {
    let width = vars.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    let mut out = String::new();
    let mut total = 0usize;
    for (name, shape) in vars {
        let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
        out.push_str(&format!("{:<width$}  [{}]\n", name, dims.join(", "), width = width));
        total += shape.iter().product::<usize>();
    }
    out.push_str(&format!("Total parameters: {}", total));
    out
}

pub fn log_variables(vars: &[(String, Vec<usize>)]) {
    log::info!("Trainable variables:\n{}", format_variables(vars));
}
