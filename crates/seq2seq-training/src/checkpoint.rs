//! Checkpoint persistence keyed by epoch number or exit tag.

use crate::backend::{ParameterState, Seq2SeqModel};
use crate::config::TAG_PLACEHOLDER;
use crate::distributed::{Accelerator, DistributedModel};
use crate::error::{TrainingError, TrainingResult};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Marker carried by every interrupt-save tag. Files containing it are never pruned.
pub const EXIT_TAG_PREFIX: &str = "exit_save";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointTag {
    Epoch(usize),
    Exit(String),
}

impl CheckpointTag {
    /// `exit_save_<YYYYmmddHHMMSS>` in local time.
    #[must_use]
    pub fn exit_now() -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        Self::Exit(format!("{EXIT_TAG_PREFIX}_{stamp}"))
    }

    #[must_use]
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit(_))
    }
}

impl std::fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Epoch(epoch) => write!(f, "{epoch}"),
            Self::Exit(tag) => f.write_str(tag),
        }
    }
}

/// Reads and writes parameter snapshots at `template` with `{}` replaced by a tag.
///
/// The placeholder must sit in the file name, so every checkpoint of a run
/// lives in the same directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    template: String,
    dir: PathBuf,
    prefix: String,
    suffix: String,
}

impl CheckpointManager {
    pub fn new(template: impl Into<String>) -> TrainingResult<Self> {
        let template = template.into();
        let path = Path::new(&template);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                TrainingError::InvalidConfig(format!("checkpoint template has no file name: {template}"))
            })?;

        let Some((prefix, suffix)) = file_name.split_once(TAG_PLACEHOLDER) else {
            return Err(TrainingError::InvalidConfig(format!(
                "checkpoint file name must contain `{TAG_PLACEHOLDER}`: {template}"
            )));
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self { prefix: prefix.to_string(), suffix: suffix.to_string(), dir, template })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, tag: &CheckpointTag) -> PathBuf {
        PathBuf::from(self.template.replacen(TAG_PLACEHOLDER, &tag.to_string(), 1))
    }

    /// Barrier on every rank, then write the unwrapped model's parameters
    /// from the main process. Overwrites an existing file for the same tag.
    ///
    /// Returns the written path on the main process and `None` elsewhere.
    pub fn save<M: Seq2SeqModel>(
        &self,
        accelerator: &Accelerator,
        model: &DistributedModel<M>,
        tag: &CheckpointTag,
    ) -> TrainingResult<Option<PathBuf>> {
        accelerator.barrier()?;
        if !accelerator.is_main_process() {
            return Ok(None);
        }

        let path = self.path_for(tag);
        write_parameters(&path, accelerator.unwrap_model(model).parameters())?;
        tracing::debug!(path = %path.display(), %tag, "checkpoint saved");
        Ok(Some(path))
    }

    pub fn load(&self, tag: &CheckpointTag) -> TrainingResult<ParameterState> {
        read_parameters(&self.path_for(tag))
    }

    /// Delete the oldest epoch checkpoints at or below `current_epoch`,
    /// keeping the `keep_latest_n` most recently modified. Exit-tagged files
    /// are never candidates. Returns the removed paths.
    pub fn prune(&self, current_epoch: usize, keep_latest_n: usize) -> TrainingResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(SystemTime, usize, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(epoch) = entry.file_name().to_str().and_then(|name| self.epoch_of(name)) else {
                continue;
            };
            if epoch > current_epoch {
                continue;
            }
            let modified = entry.metadata().map_err(std::io::Error::from)?.modified()?;
            candidates.push((modified, epoch, entry.into_path()));
        }

        if candidates.len() <= keep_latest_n {
            return Ok(Vec::new());
        }

        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let excess = candidates.len() - keep_latest_n;

        let mut removed = Vec::with_capacity(excess);
        for (_, epoch, path) in candidates.into_iter().take(excess) {
            std::fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), epoch, "pruned checkpoint");
            removed.push(path);
        }
        Ok(removed)
    }

    /// Epoch number encoded in `file_name`, if it follows this template.
    fn epoch_of(&self, file_name: &str) -> Option<usize> {
        if file_name.contains(EXIT_TAG_PREFIX) {
            return None;
        }
        let middle = file_name.strip_prefix(&self.prefix)?.strip_suffix(&self.suffix)?;
        if middle.is_empty() || !middle.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        middle.parse().ok()
    }
}

fn write_parameters(path: &Path, parameters: &ParameterState) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Written beside the target and renamed so readers never see a torn file.
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    let mut writer = BufWriter::new(File::create(&staging)?);
    bincode::serialize_into(&mut writer, parameters).map_err(|e| std::io::Error::other(e.to_string()))?;
    writer.flush()?;
    drop(writer);

    std::fs::rename(&staging, path)?;
    Ok(())
}

/// Read a checkpoint file written by [`CheckpointManager::save`].
pub fn read_parameters(path: &Path) -> TrainingResult<ParameterState> {
    if !path.exists() {
        return Err(TrainingError::CheckpointNotFound(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    bincode::deserialize_from(reader)
        .map_err(|e| TrainingError::CheckpointCorrupt { path: path.to_path_buf(), reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> CheckpointManager {
        let template = temp.path().join("model.{}.pth");
        CheckpointManager::new(template.to_string_lossy().into_owned()).unwrap()
    }

    fn touch(path: &Path, age_secs: u64) {
        std::fs::write(path, b"x").unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        File::options().write(true).open(path).unwrap().set_modified(mtime).unwrap();
    }

    fn remaining(temp: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_path_for_substitutes_tag() {
        let ckp = CheckpointManager::new("./model_save/chat_small_t5.{}.pth").unwrap();
        assert_eq!(ckp.path_for(&CheckpointTag::Epoch(3)), PathBuf::from("./model_save/chat_small_t5.3.pth"));
        assert_eq!(
            ckp.path_for(&CheckpointTag::Exit("exit_save_20240101120000".to_string())),
            PathBuf::from("./model_save/chat_small_t5.exit_save_20240101120000.pth")
        );
    }

    #[test]
    fn test_exit_tag_format() {
        let exit = CheckpointTag::exit_now();
        assert!(exit.is_exit());
        assert!(!CheckpointTag::Epoch(3).is_exit());
        let CheckpointTag::Exit(tag) = exit else { panic!("expected exit tag") };
        let stamp = tag.strip_prefix("exit_save_").unwrap();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_template_without_placeholder_is_rejected() {
        assert!(CheckpointManager::new("model.pth").is_err());
        assert!(CheckpointManager::new("run_{}/model.pth").is_err());
    }

    #[test]
    fn test_prune_removes_oldest_by_mtime() {
        let temp = TempDir::new().unwrap();
        let ckp = manager(&temp);
        // Epoch 0 is the newest file, so age (not epoch number) decides.
        touch(&temp.path().join("model.0.pth"), 10);
        touch(&temp.path().join("model.1.pth"), 400);
        touch(&temp.path().join("model.2.pth"), 300);
        touch(&temp.path().join("model.3.pth"), 200);

        let removed = ckp.prune(3, 2).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(remaining(&temp), vec!["model.0.pth", "model.3.pth"]);
    }

    #[test]
    fn test_prune_never_touches_exit_saves() {
        let temp = TempDir::new().unwrap();
        let ckp = manager(&temp);
        touch(&temp.path().join("model.exit_save_20200101000000.pth"), 10_000);
        touch(&temp.path().join("model.0.pth"), 300);
        touch(&temp.path().join("model.1.pth"), 200);
        touch(&temp.path().join("model.2.pth"), 100);

        ckp.prune(2, 1).unwrap();
        assert_eq!(remaining(&temp), vec!["model.2.pth", "model.exit_save_20200101000000.pth"]);
    }

    #[test]
    fn test_prune_is_noop_at_or_below_retention() {
        let temp = TempDir::new().unwrap();
        let ckp = manager(&temp);
        touch(&temp.path().join("model.0.pth"), 20);
        touch(&temp.path().join("model.1.pth"), 10);

        assert!(ckp.prune(1, 2).unwrap().is_empty());
        assert_eq!(remaining(&temp).len(), 2);
    }

    #[test]
    fn test_prune_ignores_later_epochs_and_foreign_files() {
        let temp = TempDir::new().unwrap();
        let ckp = manager(&temp);
        touch(&temp.path().join("model.0.pth"), 300);
        touch(&temp.path().join("model.1.pth"), 200);
        touch(&temp.path().join("model.5.pth"), 1_000);
        touch(&temp.path().join("notes.txt"), 1_000);

        ckp.prune(1, 1).unwrap();
        assert_eq!(remaining(&temp), vec!["model.1.pth", "model.5.pth", "notes.txt"]);
    }

    #[test]
    fn test_save_and_load_parameters() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("model.0.pth");
        let state = ParameterState::from([("w".to_string(), vec![1.5, -2.0])]);

        write_parameters(&path, &state).unwrap();
        assert_eq!(read_parameters(&path).unwrap(), state);
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let temp = TempDir::new().unwrap();
        let err = manager(&temp).load(&CheckpointTag::Epoch(0)).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointNotFound(_)));
    }

    #[test]
    fn test_load_corrupt_checkpoint() {
        let temp = TempDir::new().unwrap();
        let ckp = manager(&temp);
        std::fs::write(ckp.path_for(&CheckpointTag::Epoch(0)), b"\xff\xff").unwrap();
        let err = ckp.load(&CheckpointTag::Epoch(0)).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointCorrupt { .. }));
    }
}
