//! Train command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use seq2seq_training::{
    install_ctrl_c, InquirePrompt, InterruptState, ReferenceBackend, RunConfig, TrainOutcome, TrainingOrchestrator,
};
use std::sync::Arc;

use crate::launch;

/// Execute the train command.
///
/// Returns `Ok` both for a completed run and for a confirmed interrupt, so
/// the process exits 0 after an exit checkpoint is saved.
pub async fn execute(config: RunConfig, num_processes: usize) -> Result<()> {
    println!("{}", "s2s train".bold().cyan());

    let interrupt = InterruptState::new();
    let watcher = install_ctrl_c(Arc::clone(&interrupt));

    let mixed_precision = config.train.mixed_precision;
    let state = Arc::clone(&interrupt);
    let reports = tokio::task::spawn_blocking(move || {
        launch::ranks(num_processes, mixed_precision, move |accelerator| {
            TrainingOrchestrator::new(ReferenceBackend, config.train.clone(), config.model.clone(), accelerator)?
                .with_interrupt(Arc::clone(&state), Box::new(InquirePrompt))
                .train()
        })
    })
    .await
    .context("training task panicked")??;
    watcher.abort();

    let report = reports.into_iter().next().context("no rank reported a result")?;
    match &report.outcome {
        TrainOutcome::Completed => {
            println!();
            println!("{}", "Training complete".green().bold());
            println!("  Best epoch:      {}", report.best_epoch);
            println!("  Best BLEU-4:     {:.4}", report.best_bleu4);
            println!("  Optimizer steps: {}", report.optimizer_steps);
        }
        TrainOutcome::Interrupted { tag, path } => {
            println!();
            println!("{}", "Training interrupted".yellow().bold());
            println!("  Exit tag:        {tag}");
            if let Some(path) = path {
                println!("  Checkpoint:      {}", path.display().to_string().dimmed());
            }
            println!("  Epochs finished: {}", report.epochs.len());
        }
    }
    Ok(())
}
