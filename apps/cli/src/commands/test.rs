//! Test command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use seq2seq_training::{ReferenceBackend, RunConfig, TrainingOrchestrator};

use crate::launch;

/// Execute the test command against the checkpoint saved for `best_epoch`.
pub async fn execute(config: RunConfig, best_epoch: usize, num_processes: usize) -> Result<()> {
    println!("{}", "s2s test".bold().cyan());

    let mixed_precision = config.train.mixed_precision;
    let reports = tokio::task::spawn_blocking(move || {
        launch::ranks(num_processes, mixed_precision, move |accelerator| {
            TrainingOrchestrator::new(ReferenceBackend, config.train.clone(), config.model.clone(), accelerator)?
                .test(best_epoch)
        })
    })
    .await
    .context("test task panicked")??;

    let report = reports.into_iter().next().context("no rank reported a result")?;
    println!();
    println!("  Epoch:        {best_epoch}");
    println!("  Test samples: {}", report.dataset_size);
    println!("  BLEU-4:       {}", format!("{:.4}", report.avg_bleu4).green());
    Ok(())
}
