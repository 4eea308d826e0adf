//! s2s - command-line driver for seq2seq training runs.
//!
//! Loads a TOML run config, sets up the run log, wires Ctrl-C into the
//! training loop and launches one rank per requested process.

mod commands;
mod launch;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use seq2seq_training::{init_logging, RunConfig};
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "s2s.toml";

/// Seq2seq training orchestrator
///
/// Trains an encoder-decoder text model with gradient accumulation,
/// one-cycle learning rate, BLEU-4 evaluation and rolling checkpoints.
#[derive(Parser, Debug)]
#[command(name = "s2s", author, version, about = "Seq2seq training orchestrator")]
struct Args {
    /// Log level (trace, debug, info, warn, error); defaults to RUST_LOG or info
    #[arg(short, long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train for every configured epoch
    ///
    /// Press Ctrl-C during a run to be asked whether to save an exit
    /// checkpoint and stop.
    Train {
        /// Run config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Ranks to launch, one thread each
        #[arg(short = 'n', long, default_value_t = 1)]
        num_processes: usize,
    },

    /// Score a saved epoch checkpoint against the test split
    Test {
        /// Run config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Epoch whose checkpoint to load
        #[arg(short, long)]
        best_epoch: usize,

        /// Ranks to launch, one thread each
        #[arg(short = 'n', long, default_value_t = 1)]
        num_processes: usize,
    },

    /// Show host resources and the data-loading policy they imply
    Probe {
        /// Path whose disk is measured
        #[arg(long, default_value = ".")]
        path: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a run config populated with defaults
    InitConfig {
        /// Target file
        #[arg(default_value = DEFAULT_CONFIG)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Build the character vocabulary from the configured dataset files
    BuildTokenizer {
        /// Run config file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

impl Command {
    fn config_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Train { config, .. } | Self::Test { config, .. } => Some(config),
            _ => None,
        }
    }
}

/// Filter directives for both the library and this binary at `level`.
fn directives(level: &str) -> String {
    format!("seq2seq_training={level},s2s={level}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let run_config = match command.config_path() {
        Some(path) => Some(
            RunConfig::load(path).with_context(|| format!("failed to load run config {}", path.display()))?,
        ),
        None => None,
    };

    let filter = args.log_level.as_deref().map(directives);
    let log_file = init_logging(filter.as_deref(), run_config.as_ref().map(|c| c.train.log_dir.as_path()))
        .context("failed to initialize logging")?;
    if let Some(path) = log_file {
        tracing::debug!(path = %path.display(), "writing run log");
    }

    let result = match command {
        Command::Train { num_processes, .. } => {
            let config = run_config.context("run config not loaded")?;
            commands::train::execute(config, num_processes).await
        }
        Command::Test { best_epoch, num_processes, .. } => {
            let config = run_config.context("run config not loaded")?;
            commands::test::execute(config, best_epoch, num_processes).await
        }
        Command::Probe { path, json } => commands::probe::execute(&path, json),
        Command::InitConfig { path, force } => commands::init_config::execute(&path, force),
        Command::BuildTokenizer { config } => commands::build_tokenizer::execute(&config),
    };

    if let Err(err) = &result {
        tracing::error!("{err:#}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_train_defaults() {
        let args = Args::parse_from(["s2s", "train"]);
        let Some(Command::Train { config, num_processes }) = args.command else {
            panic!("expected train");
        };
        assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
        assert_eq!(num_processes, 1);
    }

    #[test]
    fn test_train_has_no_unattended_exit_flag() {
        assert!(Args::try_parse_from(["s2s", "train", "--no-confirm"]).is_err());
    }

    #[test]
    fn test_log_level_is_global() {
        let args = Args::parse_from(["s2s", "probe", "--log-level", "debug"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(directives("debug"), "seq2seq_training=debug,s2s=debug");
    }
}
