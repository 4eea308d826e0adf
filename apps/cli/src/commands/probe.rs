//! Probe command implementation.
//!
//! Reports what the training run would see at startup.

use anyhow::{Context, Result};
use colored::Colorize;
use seq2seq_training::{LoaderPolicy, Platform, ResourceProbe, SystemProbe};
use serde_json::json;
use std::path::Path;

/// Execute the probe command.
pub fn execute(path: &Path, json_output: bool) -> Result<()> {
    let snapshot = SystemProbe::new(path).probe().context("failed to probe host resources")?;
    let platform = Platform::current();
    let policy = LoaderPolicy::from_snapshot(&snapshot, platform);

    if json_output {
        let output = json!({
            "resources": snapshot,
            "policy": policy,
            "restricted_platform": platform.is_restricted(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "s2s probe".bold().cyan());
    println!();
    println!("{}", "Resources:".bold());
    println!("  Memory available: {:.2} GB", snapshot.available_memory_gb);
    println!("  Disk available:   {:.2} GB ({})", snapshot.available_disk_gb, path.display());
    println!("  Physical cores:   {}", snapshot.physical_core_count);
    println!();
    println!("{}", "Data loading:".bold());
    let in_memory = if policy.keep_in_memory { "yes".green() } else { "no".yellow() };
    println!("  Keep in memory:   {in_memory}");
    println!("  Workers:          {}", policy.num_workers);
    println!("  Pin memory:       {}", policy.pin_memory);
    Ok(())
}
