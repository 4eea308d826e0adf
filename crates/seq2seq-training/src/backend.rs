//! Contracts for the collaborators the training loop drives.
//!
//! The orchestrator never looks inside the model, tokenizer or dataset; it
//! only talks to them through these traits. `crate::reference` ships a small
//! implementation of each so the loop can run end to end.

use crate::batch::{BatchRecord, TokenBatch};
use crate::config::ModelConfig;
use crate::error::TrainingResult;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Named flat parameter (or gradient) tensors.
pub type ParameterState = BTreeMap<String, Vec<f32>>;

pub trait Tokenizer: Send + Sync {
    fn token_to_id(&self, token: &str) -> Option<u32>;

    fn vocab_size(&self) -> usize;

    /// Decode each row to text. Negative ids are never valid tokens and are skipped.
    fn decode_batch(&self, ids: &[Vec<i64>], skip_special_tokens: bool) -> Vec<String>;
}

pub trait Dataset: Send + Sync {
    type Tokenizer: Tokenizer;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collate the samples at `indices` into one padded batch.
    fn collate(&self, indices: &[usize]) -> TrainingResult<BatchRecord>;

    fn tokenizer(&self) -> &Self::Tokenizer;
}

/// Scalar loss handle returned by a forward pass.
///
/// `value` is what gets reported; `scale` is the factor applied to the
/// gradient contribution when `backward` runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Loss {
    value: f64,
    scale: f64,
}

impl Loss {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self { value, scale: 1.0 }
    }

    /// Mean loss as computed by the forward pass.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Scale the gradient contribution by `1 / divisor`.
    #[must_use]
    pub fn div(self, divisor: usize) -> Self {
        let divisor = divisor.max(1) as f64;
        Self { value: self.value, scale: self.scale / divisor }
    }
}

pub trait Seq2SeqModel: Send {
    /// Forward pass with `labels` already masked; returns the batch-mean loss.
    fn forward(&mut self, batch: &BatchRecord, labels: &TokenBatch) -> TrainingResult<Loss>;

    /// Add the gradient of the last forward pass, scaled by `loss.scale()`.
    fn backward(&mut self, loss: &Loss) -> TrainingResult<()>;

    fn generate(
        &self,
        input_ids: &TokenBatch,
        attention_mask: &TokenBatch,
        max_seq_len: usize,
    ) -> TrainingResult<TokenBatch>;

    fn parameters(&self) -> &ParameterState;

    fn load_parameters(&mut self, state: ParameterState) -> TrainingResult<()>;

    fn params_and_grads(&mut self) -> (&mut ParameterState, &mut ParameterState);

    fn zero_grad(&mut self);

    fn set_training(&mut self, training: bool);
}

pub trait Optimizer: Send {
    fn step(&mut self, model: &mut dyn Seq2SeqModel) -> TrainingResult<()>;

    fn zero_grad(&mut self, model: &mut dyn Seq2SeqModel) {
        model.zero_grad();
    }

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

pub trait BleuScorer: Send + Sync {
    /// Sentence-level BLEU-4 in `[0, 1]`.
    fn score(&self, reference: &str, candidate: &str) -> f64;
}

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub path: PathBuf,
    pub tokenizer_file: PathBuf,
    pub keep_in_memory: bool,
    pub max_seq_len: usize,
}

/// Factory for everything the orchestrator needs but does not implement.
pub trait Backend: Send + Sync {
    type Tokenizer: Tokenizer;
    type Dataset: Dataset<Tokenizer = Self::Tokenizer> + 'static;
    type Model: Seq2SeqModel;

    fn load_dataset(&self, options: &DatasetOptions) -> TrainingResult<Self::Dataset>;

    fn build_model(
        &self,
        config: &ModelConfig,
        decoder_start_token_id: u32,
        seed: u64,
    ) -> TrainingResult<Self::Model>;

    fn build_optimizer(&self, learn_rate: f64) -> Box<dyn Optimizer>;

    fn bleu_scorer(&self) -> Box<dyn BleuScorer>;
}
