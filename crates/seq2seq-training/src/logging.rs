//! Run log: console plus an append-only, date-named file.
//!
//! [`RunLogger`] picks a sink per record by emitting under one of three
//! tracing targets; the layers installed by [`init_logging`] filter on them.

use crate::distributed::Accelerator;
use crate::error::{TrainingError, TrainingResult};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub const CONSOLE_TARGET: &str = "seq2seq_training::run_log::console";
pub const FILE_TARGET: &str = "seq2seq_training::run_log::file";
pub const BOTH_TARGET: &str = "seq2seq_training::run_log::both";

pub const DEFAULT_FILTER: &str = "seq2seq_training=info,s2s=info";

/// Records under [`FILE_TARGET`] stay off the console.
#[must_use]
pub fn reaches_console(target: &str) -> bool {
    target != FILE_TARGET
}

/// Only run-log records are written to the file; library diagnostics are not.
#[must_use]
pub fn reaches_file(target: &str) -> bool {
    target == FILE_TARGET || target == BOTH_TARGET
}

/// `<log_dir>/chat_trainer-YYYYMMDD.log` for today's local date.
#[must_use]
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    let date = chrono::Local::now().format("%Y%m%d");
    log_dir.join(format!("chat_trainer-{date}.log"))
}

fn open_log_file(log_dir: &Path) -> TrainingResult<(PathBuf, File)> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_file_path(log_dir);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

/// Install the global subscriber. `directives` falls back to `RUST_LOG`,
/// then [`DEFAULT_FILTER`]. With `log_dir`, returns the log file path.
pub fn init_logging(directives: Option<&str>, log_dir: Option<&Path>) -> TrainingResult<Option<PathBuf>> {
    let filter = match directives {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| TrainingError::InvalidConfig(format!("invalid log filter `{directives}`: {e}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let console = fmt::layer()
        .without_time()
        .with_target(false)
        .with_filter(filter_fn(|meta| reaches_console(meta.target())));

    let (path, file_layer) = match log_dir {
        Some(dir) => {
            let (path, file) = open_log_file(dir)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file))
                .with_filter(filter_fn(|meta| reaches_file(meta.target())));
            (Some(path), Some(layer))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| TrainingError::Other(e.into()))?;

    Ok(path)
}

/// Run-level log records, written by the main process only.
#[derive(Debug, Clone, Copy)]
pub struct RunLogger {
    enabled: bool,
}

impl RunLogger {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    #[must_use]
    pub fn for_process(accelerator: &Accelerator) -> Self {
        Self::new(accelerator.is_main_process())
    }

    pub fn info(&self, message: &str, to_console: bool, to_file: bool) {
        if !self.enabled {
            return;
        }
        match (to_console, to_file) {
            (true, true) => tracing::info!(target: BOTH_TARGET, "{message}"),
            (true, false) => tracing::info!(target: CONSOLE_TARGET, "{message}"),
            (false, true) => tracing::info!(target: FILE_TARGET, "{message}"),
            (false, false) => {}
        }
    }

    /// Print once across ranks and append the same line to the log file.
    pub fn print_and_log(&self, accelerator: &Accelerator, message: &str) {
        accelerator.print(message);
        self.info(message, false, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tracing_subscriber::layer::Context;

    #[derive(Clone, Default)]
    struct Targets(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> Layer<S> for Targets {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(event.metadata().target().to_string());
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<String> {
        let targets = Targets::default();
        let subscriber = tracing_subscriber::registry().with(targets.clone());
        tracing::subscriber::with_default(subscriber, f);
        let out = targets.0.lock().unwrap().clone();
        out
    }

    #[test]
    fn test_run_logger_routes_by_sink() {
        let logger = RunLogger::new(true);
        let targets = capture(|| {
            logger.info("a", true, true);
            logger.info("b", true, false);
            logger.info("c", false, true);
            logger.info("d", false, false);
        });
        assert_eq!(targets, vec![BOTH_TARGET, CONSOLE_TARGET, FILE_TARGET]);
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = RunLogger::new(false);
        assert!(capture(|| logger.info("x", true, true)).is_empty());
    }

    #[test]
    fn test_sink_filters() {
        assert!(reaches_console(BOTH_TARGET));
        assert!(!reaches_console(FILE_TARGET));
        assert!(reaches_file(FILE_TARGET));
        assert!(!reaches_file(CONSOLE_TARGET));
        assert!(!reaches_file("seq2seq_training::trainer"));
    }

    #[test]
    fn test_log_file_is_date_named_and_appends() {
        let temp = TempDir::new().unwrap();
        let (path, _) = open_log_file(&temp.path().join("logs")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("chat_trainer-") && name.ends_with(".log"));
        assert_eq!(name.len(), "chat_trainer-YYYYMMDD.log".len());

        std::fs::write(&path, "first\n").unwrap();
        let (_, mut file) = open_log_file(&temp.path().join("logs")).unwrap();
        std::io::Write::write_all(&mut file, b"second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
