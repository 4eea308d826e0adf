//! Shared fixtures for the training integration tests.
//!
//! Every fixture lives in its own temp directory: JSONL splits, a character
//! tokenizer and a checkpoint template pointing at `model_save/`.

#![allow(dead_code)]

use seq2seq_training::reference::{CharTokenizer, PromptResponse};
use seq2seq_training::{
    Accelerator, ConfirmPrompt, InterruptState, MixedPrecision, ModelConfig, NoopProgressSink, Platform,
    ReferenceBackend, ResourceSnapshot, TrainConfig, TrainingOrchestrator,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const WORDS: [&str; 6] = ["ab", "ba", "abc", "cab", "bca", "ca"];

pub struct Fixture {
    pub dir: TempDir,
    pub config: TrainConfig,
}

impl Fixture {
    /// `train_samples` training pairs, four validation and three test pairs.
    pub fn new(train_samples: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        let train = pairs(train_samples);
        let valid = pairs(4);
        let test = pairs(3);

        let tokenizer = CharTokenizer::from_texts(WORDS.iter().copied());
        tokenizer.save(&root.join("model_save/tokenizer.json")).unwrap();

        write_jsonl(&root.join("data/train.jsonl"), &train);
        write_jsonl(&root.join("data/valid.jsonl"), &valid);
        write_jsonl(&root.join("data/test.jsonl"), &test);

        let config = TrainConfig {
            seed: 7,
            epochs: 2,
            batch_size_per_gpu: 2,
            learn_rate: 0.01,
            div_factor: 10.0,
            mixed_precision: MixedPrecision::No,
            gradient_accumulation_steps: 1,
            max_grad_norm: 1.0,
            log_interval: 1,
            keep_latest_n_ckp: 8,
            max_seq_len: 8,
            train_file: root.join("data/train.jsonl"),
            validation_file: root.join("data/valid.jsonl"),
            test_file: root.join("data/test.jsonl"),
            tokenizer_file: root.join("model_save/tokenizer.json"),
            model_file: root.join("model_save/chat.{}.pth").to_string_lossy().into_owned(),
            model_config_file: root.join("model_save/model_config.json"),
            log_dir: root.join("logs"),
        };

        Self { dir, config }
    }

    pub fn model_dir(&self) -> PathBuf {
        self.dir.path().join("model_save")
    }

    /// Sorted file names of every `.pth` checkpoint in the model directory.
    pub fn checkpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.model_dir())
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".pth"))
            .collect();
        names.sort();
        names
    }
}

fn pairs(count: usize) -> Vec<PromptResponse> {
    (0..count)
        .map(|i| {
            let word = WORDS[i % WORDS.len()].to_string();
            PromptResponse { prompt: word.clone(), response: word }
        })
        .collect()
}

fn write_jsonl(path: &Path, rows: &[PromptResponse]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let body: String = rows.iter().map(|row| serde_json::to_string(row).unwrap() + "\n").collect();
    std::fs::write(path, body).unwrap();
}

/// A host with plenty of memory and four cores.
pub fn roomy_host() -> ResourceSnapshot {
    ResourceSnapshot { available_memory_gb: 64.0, available_disk_gb: 500.0, physical_core_count: 4 }
}

/// Single-process orchestrator with a fixed probe and no terminal output.
pub fn orchestrator(config: TrainConfig) -> TrainingOrchestrator<ReferenceBackend> {
    orchestrator_with(ReferenceBackend, config, Accelerator::single_process(MixedPrecision::No))
}

pub fn orchestrator_with<B: seq2seq_training::Backend>(
    backend: B,
    config: TrainConfig,
    accelerator: Accelerator,
) -> TrainingOrchestrator<B> {
    TrainingOrchestrator::new(backend, config, ModelConfig::default(), accelerator)
        .unwrap()
        .with_probe(Box::new(roomy_host()))
        .with_platform(Platform::Unix)
        .with_progress(Arc::new(NoopProgressSink))
}

pub fn with_prompt<B: seq2seq_training::Backend>(
    orchestrator: TrainingOrchestrator<B>,
    state: &Arc<InterruptState>,
    prompt: impl ConfirmPrompt + 'static,
) -> TrainingOrchestrator<B> {
    orchestrator.with_interrupt(Arc::clone(state), Box::new(prompt))
}
