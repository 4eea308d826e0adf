//! Init-config command implementation.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use seq2seq_training::RunConfig;
use std::path::Path;

/// Write a default run config to `path`.
pub fn execute(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let text = RunConfig::default().to_toml()?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;

    println!("{} {}", "Wrote run config to".green(), path.display());
    Ok(())
}
