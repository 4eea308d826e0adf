//! Build-tokenizer command implementation.
//!
//! Collects every character of the configured splits into a vocabulary file.

use anyhow::{Context, Result};
use colored::Colorize;
use seq2seq_training::reference::{CharTokenizer, PromptResponse};
use seq2seq_training::{RunConfig, Tokenizer};
use std::path::Path;

/// Execute the build-tokenizer command.
pub fn execute(config_path: &Path) -> Result<()> {
    let config = RunConfig::load(config_path)
        .with_context(|| format!("failed to load run config {}", config_path.display()))?;
    let train = &config.train;

    let mut texts = read_texts(&train.train_file)?;
    for split in [&train.validation_file, &train.test_file] {
        if split.exists() {
            texts.extend(read_texts(split)?);
        } else {
            tracing::warn!(path = %split.display(), "split missing, left out of the vocabulary");
        }
    }

    let tokenizer = CharTokenizer::from_texts(texts.iter().map(String::as_str));
    tokenizer.save(&train.tokenizer_file)?;

    println!(
        "{} {} ({} tokens)",
        "Wrote tokenizer to".green(),
        train.tokenizer_file.display(),
        tokenizer.vocab_size()
    );
    Ok(())
}

fn read_texts(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut texts = Vec::new();
    for (line_no, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let row: PromptResponse = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), line_no + 1))?;
        texts.push(row.prompt);
        texts.push(row.response);
    }
    Ok(texts)
}
